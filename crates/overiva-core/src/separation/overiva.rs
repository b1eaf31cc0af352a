//! Overdetermined independent vector analysis (OverIVA)
//!
//! Extracts `K = n_src` targets from `M ≥ K` microphones. The demixing
//! matrix of each frequency bin is split into target rows `W_s` and
//! background rows `U = [J, -I]`:
//!
//! ```text
//!     ┌      ┐
//! W = │ W_s  │   K × M, updated by iterative projection
//!     │ J -I │   (M-K) × M, keeps the background orthogonal
//!     └      ┘   to the targets: W_s C Uᴴ = 0
//! ```
//!
//! with `J = (A⁻¹B)ᴴ`, `[A | B] = W_s C` and `C` the mixture covariance.
//! When `K = M` the background is empty and the update reduces to AuxIVA.

use crate::linalg::{covariance, hermitian_eigen, quadratic_form, weighted_covariance, CMatrix};
use crate::types::{BssError, BssResult, Complex, Spectrogram};

use super::{check_problem, projection_back, try_for_each_freq, Callback, SourceModel, MODEL_EPS};

/// When the background rows are recomputed from the targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackgroundUpdate {
    /// After each individual target update
    #[default]
    PerSource,
    /// Once after a full sweep over the targets
    PerIteration,
    /// Once after `n_sup_iter` sweeps over the targets
    PerGroup,
}

/// Target sweeps between background refreshes of the grouped variant.
pub const DEFAULT_GROUP_SWEEPS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct OverIvaOptions {
    pub n_iter: usize,
    pub proj_back: bool,
    pub model: SourceModel,
    /// Initialize targets from the principal eigenvectors of the mixture covariance
    pub init_eig: bool,
    pub background_update: BackgroundUpdate,
    /// Target sweeps per background refresh, used by `PerGroup`; the other
    /// schedules refresh within every sweep
    pub n_sup_iter: usize,
    pub callback_every: usize,
}

impl Default for OverIvaOptions {
    fn default() -> Self {
        Self {
            n_iter: 20,
            proj_back: true,
            model: SourceModel::Laplace,
            init_eig: false,
            background_update: BackgroundUpdate::PerSource,
            n_sup_iter: 1,
            callback_every: 10,
        }
    }
}

/// State of one frequency bin.
#[derive(Debug, Clone)]
pub(crate) struct FreqState {
    /// Observations `(n_chan, n_frames)`
    x: Vec<Vec<Complex>>,
    cov: CMatrix,
    /// Demixing matrix, one filter per row
    w: CMatrix,
    /// Current outputs `(n_chan, n_frames)`
    y: Vec<Vec<Complex>>,
}

impl FreqState {
    pub(crate) fn new(x: Vec<Vec<Complex>>) -> Self {
        let n_chan = x.len();
        let n_frames = x.first().map_or(0, |c| c.len());
        let cov = covariance(&x);
        Self {
            x,
            cov,
            w: CMatrix::identity(n_chan),
            y: vec![vec![Complex::new(0.0, 0.0); n_frames]; n_chan],
        }
    }

    fn n_chan(&self) -> usize {
        self.x.len()
    }

    pub(crate) fn demixing(&self) -> &CMatrix {
        &self.w
    }

    pub(crate) fn initialize(&mut self, n_src: usize, init_eig: bool, freq: usize) -> BssResult<()> {
        let m = self.n_chan();
        self.w = CMatrix::identity(m);
        if init_eig {
            let (values, vectors) = hermitian_eigen(&self.cov);
            for k in 0..n_src {
                let idx = m - 1 - k;
                let scale = 1.0 / values[idx].max(MODEL_EPS).sqrt();
                for i in 0..m {
                    self.w.set(k, i, vectors.get(i, idx).conj() * scale);
                }
            }
        }
        self.update_background(n_src, freq)
    }

    pub(crate) fn demix(&mut self) {
        let m = self.n_chan();
        let n_frames = self.y.first().map_or(0, |c| c.len());
        for r in 0..m {
            let row = self.w.row(r);
            for t in 0..n_frames {
                let mut acc = Complex::new(0.0, 0.0);
                for (i, wi) in row.iter().enumerate() {
                    acc += wi * self.x[i][t];
                }
                self.y[r][t] = acc;
            }
        }
    }

    /// Rebuild `J` so that the background stays orthogonal to the targets.
    pub(crate) fn update_background(&mut self, n_src: usize, freq: usize) -> BssResult<()> {
        let m = self.n_chan();
        if n_src >= m {
            return Ok(());
        }
        let wc = self.w.block(0..n_src, 0..m).mul(&self.cov);
        let a = wc.block(0..n_src, 0..n_src);
        let b = wc.block(0..n_src, n_src..m);
        let j = a
            .solve(&b)
            .ok_or(BssError::SingularMatrix { freq })?
            .hermitian();

        for r in 0..(m - n_src) {
            let row = self.w.row_mut(n_src + r);
            row[..n_src].copy_from_slice(j.row(r));
            for (c, v) in row[n_src..].iter_mut().enumerate() {
                *v = if c == r {
                    Complex::new(-1.0, 0.0)
                } else {
                    Complex::new(0.0, 0.0)
                };
            }
        }
        Ok(())
    }

    /// Iterative projection update of target row `s` with frame weights `weights`.
    pub(crate) fn update_source(&mut self, s: usize, weights: &[f64], freq: usize) -> BssResult<()> {
        let v = weighted_covariance(&self.x, Some(weights));
        ip_update(&mut self.w, &v, s, freq)
    }
}

/// `w_s = (W V)⁻¹ e_s`, normalized so that `w_sᴴ V w_s = 1`, written as row `s`.
pub(crate) fn ip_update(w: &mut CMatrix, v: &CMatrix, s: usize, freq: usize) -> BssResult<()> {
    let m = w.rows();
    let mut e = CMatrix::zeros(m, 1);
    e.set(s, 0, Complex::new(1.0, 0.0));
    let u = w
        .mul(v)
        .solve(&e)
        .ok_or(BssError::SingularMatrix { freq })?
        .column(0);

    let denom = quadratic_form(v, &u);
    if !(denom.is_finite() && denom > 0.0) {
        return Err(BssError::SingularMatrix { freq });
    }
    let scale = 1.0 / denom.sqrt();
    for (dst, ui) in w.row_mut(s).iter_mut().zip(&u) {
        *dst = ui.conj() * scale;
    }
    Ok(())
}

/// Per-frame auxiliary weights `1 / r_s(t)` of the first `n_src` outputs.
pub(crate) fn source_weights(
    states: &[FreqState],
    n_src: usize,
    model: SourceModel,
    weights: &mut [Vec<f64>],
) {
    let n_freq = states.len();
    for (s, ws) in weights.iter_mut().enumerate().take(n_src) {
        for (t, wt) in ws.iter_mut().enumerate() {
            let norm_sqr: f64 = states.iter().map(|st| st.y[s][t].norm_sqr()).sum();
            *wt = 1.0 / model.scale(norm_sqr, n_freq).max(MODEL_EPS);
        }
    }
}

/// Gather the first `n_out` outputs into a spectrogram.
pub(crate) fn collect_outputs(states: &[FreqState], n_out: usize, n_frames: usize) -> Spectrogram {
    let mut out = Spectrogram::zeros(n_frames, states.len(), n_out);
    for (f, st) in states.iter().enumerate() {
        for s in 0..n_out {
            for t in 0..n_frames {
                out.set(t, f, s, st.y[s][t]);
            }
        }
    }
    out
}

/// Extract `n_src` sources from the mixture `x` (`frames × freq × mics`).
///
/// Returns `frames × freq × n_src`. With `proj_back` the outputs are scaled
/// onto the first microphone.
pub fn overiva(
    x: &Spectrogram,
    n_src: usize,
    options: &OverIvaOptions,
    mut callback: Option<Callback<'_>>,
) -> BssResult<Spectrogram> {
    check_problem(x, n_src)?;
    let (n_frames, n_freq, _) = x.shape();

    let mut states: Vec<FreqState> = (0..n_freq).map(|f| FreqState::new(x.freq_slice(f))).collect();
    try_for_each_freq(&mut states, |f, st| st.initialize(n_src, options.init_eig, f))?;

    let every = options.callback_every.max(1);
    let schedule = options.background_update;
    let per_source = schedule == BackgroundUpdate::PerSource;
    let mut weights = vec![vec![0.0; n_frames]; n_src];

    for epoch in 0..options.n_iter {
        try_for_each_freq(&mut states, |_, st| {
            st.demix();
            Ok(())
        })?;

        if epoch % every == 0 {
            if let Some(cb) = callback.as_mut() {
                let y = collect_outputs(&states, n_src, n_frames);
                if options.proj_back {
                    cb(&projection_back(&y, x, 0)?);
                } else {
                    cb(&y);
                }
            }
        }

        source_weights(&states, n_src, options.model, &mut weights);

        for _ in 0..options.n_sup_iter.max(1) {
            try_for_each_freq(&mut states, |f, st| {
                for (s, ws) in weights.iter().enumerate() {
                    st.update_source(s, ws, f)?;
                    if per_source {
                        st.update_background(n_src, f)?;
                    }
                }
                if schedule == BackgroundUpdate::PerIteration {
                    st.update_background(n_src, f)?;
                }
                Ok(())
            })?;
        }
        if schedule == BackgroundUpdate::PerGroup {
            try_for_each_freq(&mut states, |f, st| st.update_background(n_src, f))?;
        }
    }

    try_for_each_freq(&mut states, |_, st| {
        st.demix();
        Ok(())
    })?;
    let mut y = collect_outputs(&states, n_src, n_frames);
    if options.proj_back {
        y = projection_back(&y, x, 0)?;
    }
    if !y.is_finite() {
        return Err(BssError::NonFinite {
            stage: "overiva".into(),
        });
    }
    tracing::trace!(n_src, n_iter = options.n_iter, "overiva finished");
    Ok(y)
}
