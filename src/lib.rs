pub mod cli;
pub mod logistic;
pub mod mnist;
pub mod train;

use ndarray::{ArrayView1, ArrayView2};

pub use logistic::LogisticRegression;
pub use mnist::{Dataset, MnistError, Split, SplitLayout, Splits};
pub use train::{train, TrainConfig, TrainError, TrainReport, TrainingSession};

/// What the training loop needs from a model: a differentiable loss, a 0/1
/// error rate, and a way to take one gradient step on a minibatch.
///
/// Rows of `x` are examples; `y` holds the matching class indices.
pub trait Classifier {
    /// Mean negative log-likelihood of `y` under the model.
    fn negative_log_likelihood(&self, x: ArrayView2<'_, f64>, y: ArrayView1<'_, usize>) -> f64;

    /// Fraction of rows the model misclassifies, in `[0, 1]`.
    fn errors(&self, x: ArrayView2<'_, f64>, y: ArrayView1<'_, usize>) -> f64;

    /// Compute the loss and its gradient from the current parameters, then
    /// move every parameter by `-learning_rate * gradient`. Returns the loss
    /// measured before the update.
    fn gradient_step(
        &mut self,
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, usize>,
        learning_rate: f64,
    ) -> f64;
}
