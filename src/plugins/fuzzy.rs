//! Adaptive fuzzy classification of metric samples.
//!
//! A `FuzzyValidator` owns a bounded sample history and three thresholds
//! (`low <= med <= high`). Every `update_every` samples the thresholds are
//! re-estimated as the 30th/60th/85th percentiles of the history, clamped
//! element-wise to `min_thresholds`. Each sample is then labelled by a
//! `Classifier`.

use crate::core::testcase::{ClassifierMode, ClassifierSettings};
use crate::plugins::metrics::MetricFn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::VecDeque;

const RECALIBRATION_PERCENTILES: [f64; 3] = [30.0, 60.0, 85.0];

/// Trapezoidal membership over `(a, b, c, d)`, `a <= b <= c <= d`.
///
/// Points are evaluated in the same order as the reference fuzzy toolkit:
/// the rising edge covers `x <= b`, the falling edge `x >= c` (and wins
/// when the two overlap), and anything outside `[a, d]` is zero.
pub fn trapezoid(x: f64, points: [f64; 4]) -> f64 {
    let [a, b, c, d] = points;
    let mut y = 1.0;
    if x <= b {
        y = rising_edge(x, a, b);
    }
    if x >= c {
        y = falling_edge(x, c, d);
    }
    if x < a || x > d {
        y = 0.0;
    }
    y
}

fn rising_edge(x: f64, a: f64, b: f64) -> f64 {
    if x == b {
        1.0
    } else if a != b && a < x && x < b {
        (x - a) / (b - a)
    } else {
        0.0
    }
}

fn falling_edge(x: f64, c: f64, d: f64) -> f64 {
    if x == c {
        1.0
    } else if c != d && c < x && x < d {
        (d - x) / (d - c)
    } else {
        0.0
    }
}

fn sorted4(mut pts: [f64; 4]) -> [f64; 4] {
    pts.sort_by(f64::total_cmp);
    pts
}

/// LOW/MED/HIGH memberships of `value` for the given thresholds.
pub fn memberships(value: f64, thresholds: &[f64; 3]) -> [f64; 3] {
    let mut t = *thresholds;
    t.sort_by(f64::total_cmp);
    let [low, med, high] = t;
    let low_pts = sorted4([0.0, 0.0, low * 0.8, low]);
    let med_pts = sorted4([low * 0.8, low, med, high * 0.8]);
    let high_pts = sorted4([med, high * 0.8, 100.0, 100.0]);
    [
        trapezoid(value, low_pts),
        trapezoid(value, med_pts),
        trapezoid(value, high_pts),
    ]
}

/// Index of the first maximum.
pub fn argmax_first(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

/// Linear-interpolated percentile of an ascending slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let rank = p / 100.0 * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub label: String,
    pub membership: Vec<f64>,
}

pub trait Classifier {
    fn classify(&mut self, value: f64, thresholds: &[f64; 3], labels: &[String]) -> Classification;

    /// False for classifiers whose output is not a function of the input.
    fn is_deterministic(&self) -> bool {
        true
    }
}

/// Deterministic trapezoidal classifier over three labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapezoidClassifier;

impl Classifier for TrapezoidClassifier {
    fn classify(&mut self, value: f64, thresholds: &[f64; 3], labels: &[String]) -> Classification {
        let membership = memberships(value, thresholds);
        let idx = argmax_first(&membership);
        Classification {
            label: labels.get(idx).cloned().unwrap_or_default(),
            membership: membership.to_vec(),
        }
    }
}

/// Experimental placeholder for a learned classifier.
///
/// Ignores the value and draws a point uniformly from the probability simplex
/// over the labels (a flat Dirichlet), labelling by its argmax. Output is
/// random unless the generator is seeded.
#[derive(Debug, Clone)]
pub struct StochasticClassifier<R: Rng> {
    rng: R,
}

impl StochasticClassifier<StdRng> {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl<R: Rng> StochasticClassifier<R> {
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }

    fn simplex_point(&mut self, n: usize) -> Vec<f64> {
        // Normalised Exp(1) draws are Dirichlet(1, ..., 1).
        let draws: Vec<f64> = (0..n)
            .map(|_| {
                let u: f64 = self.rng.r#gen();
                -(1.0 - u).ln()
            })
            .collect();
        let sum: f64 = draws.iter().sum();
        if sum > 0.0 {
            draws.iter().map(|d| d / sum).collect()
        } else {
            vec![1.0 / n as f64; n]
        }
    }
}

impl<R: Rng> Classifier for StochasticClassifier<R> {
    fn classify(&mut self, _value: f64, _thresholds: &[f64; 3], labels: &[String]) -> Classification {
        let membership = self.simplex_point(labels.len());
        let idx = argmax_first(&membership);
        Classification {
            label: labels.get(idx).cloned().unwrap_or_default(),
            membership,
        }
    }

    fn is_deterministic(&self) -> bool {
        false
    }
}

/// Classifier for `mode`; `seed` pins the stochastic one.
pub fn build_classifier(mode: ClassifierMode, seed: Option<u64>) -> Box<dyn Classifier> {
    match mode {
        ClassifierMode::Classic => Box::new(TrapezoidClassifier),
        ClassifierMode::NeuroFuzzy => match seed {
            Some(seed) => Box::new(StochasticClassifier::seeded(seed)),
            None => Box::new(StochasticClassifier::from_entropy()),
        },
    }
}

/// Threshold and history state for one fuzzy step.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierState {
    thresholds: [f64; 3],
    min_thresholds: [f64; 3],
    history: VecDeque<f64>,
    history_size: usize,
    update_every: usize,
    sample_count: usize,
    label_names: Vec<String>,
}

impl ClassifierState {
    pub fn new(settings: &ClassifierSettings) -> Self {
        let history_size = settings.history_size.max(1);
        Self {
            thresholds: settings.thresholds,
            min_thresholds: settings.min_thresholds,
            history: VecDeque::with_capacity(history_size + 1),
            history_size,
            update_every: settings.update_every.max(1),
            sample_count: 0,
            label_names: settings.label_names.clone(),
        }
    }

    /// Record a sample; returns true when thresholds were recalibrated.
    pub fn observe(&mut self, value: f64) -> bool {
        self.history.push_back(value);
        while self.history.len() > self.history_size {
            self.history.pop_front();
        }
        self.sample_count += 1;
        if self.sample_count % self.update_every == 0 && self.history.len() >= self.update_every {
            self.recalibrate();
            return true;
        }
        false
    }

    fn recalibrate(&mut self) {
        let mut sorted: Vec<f64> = self.history.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        for (i, p) in RECALIBRATION_PERCENTILES.iter().enumerate() {
            self.thresholds[i] = percentile(&sorted, *p).max(self.min_thresholds[i]);
        }
    }

    pub fn thresholds(&self) -> [f64; 3] {
        self.thresholds
    }

    pub fn history(&self) -> Vec<f64> {
        self.history.iter().copied().collect()
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn label_names(&self) -> &[String] {
        &self.label_names
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub value: f64,
    pub label: String,
    pub membership: Vec<f64>,
    pub thresholds: [f64; 3],
    pub recalibrated: bool,
}

/// Samples a metric and classifies each reading.
pub struct FuzzyValidator {
    metric: MetricFn,
    state: ClassifierState,
    classifier: Box<dyn Classifier>,
}

impl FuzzyValidator {
    pub fn new(
        metric: MetricFn,
        settings: &ClassifierSettings,
        classifier: Box<dyn Classifier>,
    ) -> Self {
        Self {
            metric,
            state: ClassifierState::new(settings),
            classifier,
        }
    }

    pub fn is_deterministic(&self) -> bool {
        self.classifier.is_deterministic()
    }

    pub fn state(&self) -> &ClassifierState {
        &self.state
    }

    /// Sample once, update history/thresholds, then classify with the
    /// current thresholds.
    pub fn validate(&mut self) -> Sample {
        let value = (self.metric)();
        let recalibrated = self.state.observe(value);
        let thresholds = self.state.thresholds();
        let Classification { label, membership } =
            self.classifier
                .classify(value, &thresholds, self.state.label_names());
        Sample {
            value,
            label,
            membership,
            thresholds,
            recalibrated,
        }
    }
}
