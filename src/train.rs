use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, trace};
use ndarray::{ArrayView1, ArrayView2};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::{
    mnist::{cast_images, cast_labels, Split, Splits},
    Classifier,
};

#[derive(Debug, Error, PartialEq)]
pub enum TrainError {
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    #[error("learning rate must be positive and finite, got {0}")]
    LearningRate(f64),
    #[error("{name} split has {len} examples, fewer than one batch of {batch_size}")]
    EmptySplit {
        name: &'static str,
        len: usize,
        batch_size: usize,
    },
}

/// Hyperparameters of minibatch gradient descent with early stopping.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub learning_rate: f64,
    pub n_epochs: usize,
    /// Look at this many minibatches regardless.
    pub patience: usize,
    /// Wait this much longer when a new best is found.
    pub patience_increase: usize,
    /// A relative improvement of this much is considered significant.
    pub improvement_threshold: f64,
    /// Draw an epoch progress bar on stderr.
    pub progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            learning_rate: 0.13,
            n_epochs: 1000,
            patience: 100,
            patience_increase: 2,
            improvement_threshold: 0.995,
            progress: true,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self, splits: &Splits) -> Result<(), TrainError> {
        if self.batch_size == 0 {
            return Err(TrainError::ZeroBatchSize);
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.) {
            return Err(TrainError::LearningRate(self.learning_rate));
        }

        for (name, split) in [
            ("train", &splits.train),
            ("validation", &splits.valid),
            ("test", &splits.test),
        ] {
            if split.n_batches(self.batch_size) == 0 {
                return Err(TrainError::EmptySplit {
                    name,
                    len: split.len(),
                    batch_size: self.batch_size,
                });
            }
        }

        Ok(())
    }

    /// Minibatches between two validation passes: `min(n_train_batches,
    /// patience / 2)`, never less than one.
    pub fn validation_frequency(&self, n_train_batches: usize) -> usize {
        n_train_batches.min(self.patience / 2).max(1)
    }
}

/// One validation pass of the training loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Checkpoint {
    pub epoch: usize,
    /// 1-based, as printed.
    pub minibatch: usize,
    pub iter: usize,
    pub validation_loss: f64,
    pub best_validation_loss: f64,
    pub patience: usize,
    /// Set when this pass produced a new best model.
    pub test_score: Option<f64>,
}

/// Everything the loop mutates between minibatches.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSession {
    pub best_validation_loss: f64,
    pub patience: usize,
    /// Test error of the best model so far, not necessarily the last one.
    pub test_score: f64,
    pub epoch: usize,
    pub iter: usize,
    pub steps: usize,
    pub done_looping: bool,
    pub history: Vec<Checkpoint>,
}

impl TrainingSession {
    pub fn new(patience: usize) -> Self {
        Self {
            best_validation_loss: f64::INFINITY,
            patience,
            test_score: 0.,
            epoch: 0,
            iter: 0,
            steps: 0,
            done_looping: false,
            history: Vec::new(),
        }
    }

    /// Fold one validation loss into the session. Returns true when it is a
    /// new best, in which case the caller owes a test pass.
    pub fn observe_validation(
        &mut self,
        this_validation_loss: f64,
        config: &TrainConfig,
    ) -> bool {
        if this_validation_loss >= self.best_validation_loss || this_validation_loss.is_nan() {
            return false;
        }

        if this_validation_loss < self.best_validation_loss * config.improvement_threshold {
            let extended = self.patience.max(self.iter * config.patience_increase);
            if extended != self.patience {
                debug!("patience {} -> {} at iter {}", self.patience, extended, self.iter);
            }
            self.patience = extended;
        }

        self.best_validation_loss = this_validation_loss;
        true
    }

    pub fn should_stop(&self) -> bool {
        self.patience <= self.iter
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub session: TrainingSession,
    pub elapsed: Duration,
}

impl TrainReport {
    pub fn epochs(&self) -> usize {
        self.session.epoch
    }

    pub fn best_validation_loss(&self) -> f64 {
        self.session.best_validation_loss
    }

    pub fn test_score(&self) -> f64 {
        self.session.test_score
    }

    /// Zero when no measurable time has passed.
    pub fn epochs_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0. {
            self.session.epoch as f64 / secs
        } else {
            0.
        }
    }
}

/// Mean error over every full minibatch of `split`.
pub fn mean_batch_errors<C: Classifier>(model: &C, split: &Split, batch_size: usize) -> f64 {
    let n_batches = split.n_batches(batch_size);
    let total: f64 = (0..n_batches)
        .map(|index| {
            let (x, y) = split.batch(index, batch_size);
            model.errors(x, y)
        })
        .sum();

    total / n_batches as f64
}

/// Error over a whole split in a single pass.
pub fn split_errors<C: Classifier>(model: &C, split: &Split) -> f64 {
    model.errors(split.images.view(), split.labels.view())
}

/// Error over raw dataset rows, cast on the fly.
pub fn raw_errors<C: Classifier>(
    model: &C,
    images: ArrayView2<'_, f32>,
    labels: ArrayView1<'_, u8>,
) -> f64 {
    model.errors(cast_images(images).view(), cast_labels(labels).view())
}

fn progress_bar(config: &TrainConfig) -> ProgressBar {
    if !config.progress {
        return ProgressBar::hidden();
    }

    let bar = ProgressBar::new(config.n_epochs as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "[{elapsed:.green}] [{wide_bar:.cyan/red}] {pos:.red}/{len:.green} epochs ({eta})",
    ) {
        bar.set_style(style.progress_chars("=> "));
    }
    bar
}

/// Minibatch gradient descent with patience-based early stopping.
///
/// Every `validation_frequency` minibatches the validation split is scored;
/// a new best score triggers a test pass, and a significant one pushes the
/// patience horizon out to `iter * patience_increase`. Training ends once
/// `patience <= iter` or after `n_epochs` epochs.
pub fn train<C: Classifier>(
    model: &mut C,
    splits: &Splits,
    config: &TrainConfig,
) -> Result<TrainReport, TrainError> {
    config.validate(splits)?;

    let batch_size = config.batch_size;
    let n_train_batches = splits.train.n_batches(batch_size);
    let validation_frequency = config.validation_frequency(n_train_batches);

    let bar = progress_bar(config);
    let mut session = TrainingSession::new(config.patience);
    let start = Instant::now();

    while session.epoch < config.n_epochs && !session.done_looping {
        session.epoch += 1;

        for minibatch_index in 0..n_train_batches {
            let (x, y) = splits.train.batch(minibatch_index, batch_size);
            let minibatch_avg_cost = model.gradient_step(x, y, config.learning_rate);
            session.steps += 1;
            session.iter = (session.epoch - 1) * n_train_batches + minibatch_index;
            trace!("iter {} cost {}", session.iter, minibatch_avg_cost);

            if (session.iter + 1) % validation_frequency == 0 {
                let this_validation_loss =
                    mean_batch_errors(&*model, &splits.valid, batch_size);

                bar.suspend(|| {
                    println!(
                        "epoch {}, minibatch {}/{}, validation error {:.6} %",
                        session.epoch,
                        minibatch_index + 1,
                        n_train_batches,
                        this_validation_loss * 100.
                    )
                });

                let test_score = if session.observe_validation(this_validation_loss, config) {
                    session.test_score = mean_batch_errors(&*model, &splits.test, batch_size);

                    bar.suspend(|| {
                        println!(
                            "     epoch {}, minibatch {}/{}, test error of best model {:.6} %",
                            session.epoch,
                            minibatch_index + 1,
                            n_train_batches,
                            session.test_score * 100.
                        )
                    });
                    Some(session.test_score)
                } else {
                    None
                };

                session.history.push(Checkpoint {
                    epoch: session.epoch,
                    minibatch: minibatch_index + 1,
                    iter: session.iter,
                    validation_loss: this_validation_loss,
                    best_validation_loss: session.best_validation_loss,
                    patience: session.patience,
                    test_score,
                });
            }

            if session.should_stop() {
                session.done_looping = true;
                break;
            }
        }

        bar.inc(1);
    }

    bar.finish_and_clear();

    Ok(TrainReport {
        session,
        elapsed: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2};

    /// Scores itself by how many gradient steps it has taken.
    struct Scripted<F: Fn(usize) -> f64> {
        steps: usize,
        score: F,
    }

    impl<F: Fn(usize) -> f64> Scripted<F> {
        fn new(score: F) -> Self {
            Self { steps: 0, score }
        }
    }

    impl<F: Fn(usize) -> f64> Classifier for Scripted<F> {
        fn negative_log_likelihood(&self, _: ArrayView2<'_, f64>, _: ArrayView1<'_, usize>) -> f64 {
            0.
        }

        fn errors(&self, _: ArrayView2<'_, f64>, _: ArrayView1<'_, usize>) -> f64 {
            (self.score)(self.steps)
        }

        fn gradient_step(
            &mut self,
            _: ArrayView2<'_, f64>,
            _: ArrayView1<'_, usize>,
            _: f64,
        ) -> f64 {
            self.steps += 1;
            0.
        }
    }

    fn split(len: usize) -> Split {
        Split {
            images: Array2::zeros((len, 1)),
            labels: Array1::zeros(len),
        }
    }

    fn splits() -> Splits {
        Splits {
            train: split(1000),
            valid: split(100),
            test: split(100),
        }
    }

    fn quiet() -> TrainConfig {
        TrainConfig {
            progress: false,
            ..TrainConfig::default()
        }
    }

    fn assert_monotone(session: &TrainingSession) {
        for pair in session.history.windows(2) {
            assert!(pair[1].best_validation_loss <= pair[0].best_validation_loss);
            assert!(pair[1].patience >= pair[0].patience);
        }
    }

    #[test]
    fn validation_frequency_is_capped_by_half_the_patience() {
        let config = TrainConfig::default();
        assert_eq!(config.validation_frequency(20), 20);
        assert_eq!(config.validation_frequency(100), 50);

        let impatient = TrainConfig {
            patience: 1,
            ..TrainConfig::default()
        };
        assert_eq!(impatient.validation_frequency(20), 1);
    }

    #[test]
    fn stagnant_validation_stops_once_patience_runs_out() {
        let mut model = Scripted::new(|_| 0.5);
        let report = train(&mut model, &splits(), &quiet()).unwrap();
        let session = &report.session;

        // first pass at iter 19 sets patience to max(100, 38) = 100, then
        // nothing improves and the loop halts at iter 100
        assert_eq!(session.patience, 100);
        assert_eq!(session.iter, 100);
        assert!(session.done_looping);
        assert_eq!(report.epochs(), 6);
        assert_eq!(session.steps, 101);

        let iters: Vec<_> = session.history.iter().map(|c| c.iter).collect();
        assert_eq!(iters, vec![19, 39, 59, 79, 99]);
        assert_eq!(session.history[0].test_score, Some(0.5));
        assert!(session.history[1..].iter().all(|c| c.test_score.is_none()));
        assert_eq!(report.best_validation_loss(), 0.5);
        assert_eq!(report.test_score(), 0.5);
    }

    #[test]
    fn steady_improvement_runs_to_the_epoch_limit() {
        let mut model = Scripted::new(|steps| 1. / (1. + steps as f64));
        let config = TrainConfig {
            n_epochs: 10,
            ..quiet()
        };
        let report = train(&mut model, &splits(), &config).unwrap();
        let session = &report.session;

        assert!(!session.done_looping);
        assert_eq!(report.epochs(), 10);
        assert_eq!(session.steps, 200);
        assert_eq!(session.history.len(), 10);
        assert_eq!(session.patience, 2 * 199);
        assert!(session.history.iter().all(|c| c.test_score.is_some()));
        assert_eq!(report.best_validation_loss(), 1. / 201.);
        assert_monotone(session);
    }

    #[test]
    fn marginal_improvement_updates_best_without_extending_patience() {
        let mut model = Scripted::new(|steps| 0.5 - 1e-6 * steps as f64);
        let report = train(&mut model, &splits(), &quiet()).unwrap();
        let session = &report.session;

        assert_eq!(session.patience, 100);
        assert_eq!(report.epochs(), 6);
        assert_eq!(session.history.len(), 5);
        assert!(session.history.iter().all(|c| c.test_score.is_some()));
        for pair in session.history.windows(2) {
            assert!(pair[1].best_validation_loss < pair[0].best_validation_loss);
        }
        assert_eq!(report.test_score(), 0.5 - 1e-6 * 100.);
    }

    #[test]
    fn stop_fires_between_validation_passes() {
        let mut model = Scripted::new(|_| 0.9);
        let config = TrainConfig {
            patience: 25,
            ..quiet()
        };
        let report = train(&mut model, &splits(), &config).unwrap();
        let session = &report.session;

        // validation every min(20, 12) = 12 minibatches; iter 11 keeps
        // patience at max(25, 22) = 25, so iter 25 ends training even though
        // it is not a validation point
        let iters: Vec<_> = session.history.iter().map(|c| c.iter).collect();
        assert_eq!(iters, vec![11, 23]);
        assert_eq!(session.iter, 25);
        assert_eq!(session.steps, 26);
        assert_eq!(report.epochs(), 2);
    }

    #[test]
    fn zero_epochs_never_touches_the_model() {
        let mut model = Scripted::new(|_| 0.5);
        let config = TrainConfig {
            n_epochs: 0,
            ..quiet()
        };
        let report = train(&mut model, &splits(), &config).unwrap();

        assert_eq!(model.steps, 0);
        assert_eq!(report.epochs(), 0);
        assert_eq!(report.best_validation_loss(), f64::INFINITY);
    }

    #[test]
    fn nan_validation_is_never_a_new_best() {
        let mut session = TrainingSession::new(100);
        assert!(!session.observe_validation(f64::NAN, &TrainConfig::default()));
        assert_eq!(session.best_validation_loss, f64::INFINITY);
    }

    #[test]
    fn invalid_configurations_are_rejected() {
        let mut model = Scripted::new(|_| 0.5);

        let zero_batch = TrainConfig {
            batch_size: 0,
            ..quiet()
        };
        assert_eq!(
            train(&mut model, &splits(), &zero_batch).unwrap_err(),
            TrainError::ZeroBatchSize
        );

        let huge_batch = TrainConfig {
            batch_size: 500,
            ..quiet()
        };
        assert_eq!(
            train(&mut model, &splits(), &huge_batch).unwrap_err(),
            TrainError::EmptySplit {
                name: "validation",
                len: 100,
                batch_size: 500
            }
        );

        let bad_rate = TrainConfig {
            learning_rate: f64::NAN,
            ..quiet()
        };
        assert!(matches!(
            train(&mut model, &splits(), &bad_rate),
            Err(TrainError::LearningRate(_))
        ));

        for learning_rate in [0.0, -0.13] {
            let config = TrainConfig {
                learning_rate,
                ..quiet()
            };
            assert_eq!(
                config.validate(&splits()),
                Err(TrainError::LearningRate(learning_rate))
            );
        }
        assert_eq!(model.steps, 0);
    }

    #[test]
    fn throughput_is_finite_for_an_instant_run() {
        let report = TrainReport {
            session: TrainingSession::new(100),
            elapsed: Duration::ZERO,
        };
        assert_eq!(report.epochs_per_sec(), 0.);

        let mut session = TrainingSession::new(100);
        session.epoch = 6;
        let report = TrainReport {
            session,
            elapsed: Duration::from_secs(2),
        };
        assert_eq!(report.epochs_per_sec(), 3.);
    }

    #[test]
    fn batch_mean_matches_whole_split_for_uniform_batches() {
        let model = Scripted::new(|_| 0.25);
        let test = split(100);

        assert_eq!(mean_batch_errors(&model, &test, 50), 0.25);
        assert_eq!(split_errors(&model, &test), 0.25);
    }
}
