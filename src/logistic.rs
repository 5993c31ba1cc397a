use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::Classifier;

const INIT_STD: f64 = 0.01;

/// Multi-class logistic regression: `P(Y = k | x) = softmax(x W + b)_k`.
#[derive(Debug, Clone, PartialEq)]
pub struct LogisticRegression {
    /// `n_in x n_out`
    pub w: Array2<f64>,
    pub b: Array1<f64>,
}

impl LogisticRegression {
    /// All-zero parameters, so every run starts from the same point.
    pub fn new(n_in: usize, n_out: usize) -> Self {
        Self {
            w: Array2::zeros((n_in, n_out)),
            b: Array1::zeros(n_out),
        }
    }

    /// Parameters drawn from `N(0, 0.01^2)`. The same seed always gives the
    /// same parameters.
    pub fn with_random_init(n_in: usize, n_out: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut sample = || rng.sample::<f64, _>(StandardNormal) * INIT_STD;

        let w = Array2::from_shape_simple_fn((n_in, n_out), &mut sample);
        let b = Array1::from_shape_simple_fn(n_out, &mut sample);
        Self { w, b }
    }

    pub fn n_in(&self) -> usize {
        self.w.nrows()
    }

    pub fn n_out(&self) -> usize {
        self.w.ncols()
    }

    /// Class probabilities, one row per example.
    pub fn p_y_given_x(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        let mut p = x.dot(&self.w) + &self.b;

        for mut row in p.rows_mut() {
            let max = row.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
            row.mapv_inplace(|z| (z - max).exp());
            let sum = row.sum();
            row /= sum;
        }

        p
    }

    /// Most probable class per row; ties go to the lowest index.
    pub fn predict(&self, x: ArrayView2<'_, f64>) -> Array1<usize> {
        self.p_y_given_x(x)
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |best, (i, &p)| {
                        if p > best.1 {
                            (i, p)
                        } else {
                            best
                        }
                    })
                    .0
            })
            .collect()
    }

    /// Gradient of the mean negative log-likelihood with respect to `w` and
    /// `b`.
    pub fn gradients(
        &self,
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, usize>,
    ) -> (Array2<f64>, Array1<f64>) {
        let (_, g_w, g_b) = self.loss_and_gradients(x, y);
        (g_w, g_b)
    }

    fn loss_and_gradients(
        &self,
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, usize>,
    ) -> (f64, Array2<f64>, Array1<f64>) {
        let n = x.nrows() as f64;
        let mut delta = self.p_y_given_x(x);

        let loss = -y
            .iter()
            .enumerate()
            .map(|(i, &label)| delta[[i, label]].ln())
            .sum::<f64>()
            / n;

        // d(-log softmax)/dz = p - onehot(y)
        for (i, &label) in y.iter().enumerate() {
            delta[[i, label]] -= 1.;
        }
        delta /= n;

        let g_w = x.t().dot(&delta);
        let g_b = delta.sum_axis(Axis(0));

        (loss, g_w, g_b)
    }
}

impl Classifier for LogisticRegression {
    fn negative_log_likelihood(&self, x: ArrayView2<'_, f64>, y: ArrayView1<'_, usize>) -> f64 {
        let p = self.p_y_given_x(x);
        -y.iter()
            .enumerate()
            .map(|(i, &label)| p[[i, label]].ln())
            .sum::<f64>()
            / x.nrows() as f64
    }

    fn errors(&self, x: ArrayView2<'_, f64>, y: ArrayView1<'_, usize>) -> f64 {
        let wrong = self
            .predict(x)
            .iter()
            .zip(y.iter())
            .filter(|(predicted, label)| predicted != label)
            .count();

        wrong as f64 / y.len() as f64
    }

    fn gradient_step(
        &mut self,
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, usize>,
        learning_rate: f64,
    ) -> f64 {
        let (loss, g_w, g_b) = self.loss_and_gradients(x, y);

        self.w.scaled_add(-learning_rate, &g_w);
        self.b.scaled_add(-learning_rate, &g_b);

        loss
    }
}
