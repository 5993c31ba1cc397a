use std::path::PathBuf;

use anyhow::{ensure, Context};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use crate::{
    logistic::LogisticRegression,
    mnist::{self, SplitLayout, CLASSES, IMAGE_PIXELS},
    train::{self, raw_errors, split_errors, TrainConfig},
};

#[derive(Parser, Debug)]
#[command(
    name = "mnist-logreg",
    version,
    about = "Logistic regression on a small MNIST subset with early stopping",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
    /// Options for `train`, which also runs when no subcommand is given.
    #[command(flatten)]
    pub train: TrainArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Train the classifier and report validation/test error.
    Train(TrainArgs),
    /// Build the mini dataset container from the standard MNIST gzip files.
    Pack(PackArgs),
    /// Print the first few images as braille art.
    Preview(PreviewArgs),
}

#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    /// Dataset container (gzip of an image IDX record and a label IDX record).
    #[arg(long, default_value = "mini_mnist.idx.gz")]
    pub data: PathBuf,
    /// Start from seeded random weights instead of zeros.
    #[arg(long)]
    pub seed: Option<u64>,
    #[arg(long, default_value_t = 50)]
    pub batch_size: usize,
    #[arg(long, default_value_t = 0.13)]
    pub learning_rate: f64,
    #[arg(long, default_value_t = 1000)]
    pub epochs: usize,
    #[arg(long, default_value_t = 100)]
    pub patience: usize,
    #[arg(long, default_value_t = 2)]
    pub patience_increase: usize,
    #[arg(long, default_value_t = 0.995)]
    pub improvement_threshold: f64,
    /// Training examples, taken from the start of the file.
    #[arg(long = "train", default_value_t = 1000)]
    pub train_size: usize,
    /// Validation examples, following the training ones.
    #[arg(long = "valid", default_value_t = 100)]
    pub valid_size: usize,
    /// Test examples, following the validation ones.
    #[arg(long = "test", default_value_t = 100)]
    pub test_size: usize,
    /// Hide the progress bar.
    #[arg(long, default_value_t = false)]
    pub no_progress: bool,
}

impl TrainArgs {
    pub fn config(&self) -> TrainConfig {
        TrainConfig {
            batch_size: self.batch_size,
            learning_rate: self.learning_rate,
            n_epochs: self.epochs,
            patience: self.patience,
            patience_increase: self.patience_increase,
            improvement_threshold: self.improvement_threshold,
            progress: !self.no_progress,
        }
    }

    pub fn layout(&self) -> SplitLayout {
        SplitLayout {
            train: self.train_size,
            valid: self.valid_size,
            test: self.test_size,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct PackArgs {
    /// e.g. train-images-idx3-ubyte.gz
    #[arg(long)]
    pub images: PathBuf,
    /// e.g. train-labels-idx1-ubyte.gz
    #[arg(long)]
    pub labels: PathBuf,
    /// Number of leading examples to keep.
    #[arg(long, default_value_t = 1200)]
    pub count: usize,
    #[arg(long, default_value = "mini_mnist.idx.gz")]
    pub out: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct PreviewArgs {
    #[arg(long, default_value = "mini_mnist.idx.gz")]
    pub data: PathBuf,
    #[arg(long, default_value_t = 8)]
    pub count: usize,
    /// Pixels at or above this intensity are drawn.
    #[arg(long, default_value_t = 0.5)]
    pub threshold: f32,
}

pub fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Some(Command::Train(args)) => run_train(args),
        Some(Command::Pack(args)) => run_pack(args),
        Some(Command::Preview(args)) => run_preview(args),
        None => run_train(cli.train),
    }
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let dataset = mnist::read(&args.data)
        .with_context(|| format!("failed to load dataset {}", args.data.display()))?;
    info!(
        "loaded {} examples of {} pixels from {}",
        dataset.len(),
        dataset.input_dim(),
        args.data.display()
    );

    let layout = args.layout();
    let splits = dataset
        .splits(&layout)
        .context("dataset too small for the requested splits")?;
    let config = args.config();

    println!("... building the model");
    let mut classifier = match args.seed {
        Some(seed) => LogisticRegression::with_random_init(dataset.input_dim(), CLASSES, seed),
        None => LogisticRegression::new(dataset.input_dim(), CLASSES),
    };
    info!(
        "logistic regression {} -> {} classes",
        classifier.n_in(),
        classifier.n_out()
    );

    println!("... training the model");
    let report = train::train(&mut classifier, &splits, &config)?;

    println!(
        "Optimization complete with best validation score of {:.6} %,with test performance {:.6} %",
        report.best_validation_loss() * 100.,
        report.test_score() * 100.
    );
    println!(
        "The code run for {} epochs, with {:.6} epochs/sec",
        report.epochs(),
        report.epochs_per_sec()
    );
    eprintln!(
        "The code for file {} ran for {:.1}s",
        env!("CARGO_PKG_NAME"),
        report.elapsed.as_secs_f64()
    );

    let (raw_images, raw_labels) = dataset.raw(layout.test_range())?;
    println!(
        "total test score of {:.6} %",
        split_errors(&classifier, &splits.test) * 100.
    );
    println!(
        "total test score of {:.6} %",
        raw_errors(&classifier, raw_images, raw_labels) * 100.
    );

    Ok(())
}

pub fn run_pack(args: PackArgs) -> anyhow::Result<()> {
    let dataset = mnist::read_idx_pair(&args.images, &args.labels).with_context(|| {
        format!(
            "failed to read {} / {}",
            args.images.display(),
            args.labels.display()
        )
    })?;
    let mini = dataset.head(args.count);
    if mini.len() < args.count {
        warn!(
            "asked for {} examples but the source only has {}",
            args.count,
            mini.len()
        );
    }

    mnist::write(&args.out, &mini)
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    info!("wrote {} examples to {}", mini.len(), args.out.display());

    Ok(())
}

pub fn run_preview(args: PreviewArgs) -> anyhow::Result<()> {
    let dataset = mnist::read(&args.data)
        .with_context(|| format!("failed to load dataset {}", args.data.display()))?;
    ensure!(
        dataset.input_dim() == IMAGE_PIXELS,
        "preview needs {}-pixel images, dataset has {}",
        IMAGE_PIXELS,
        dataset.input_dim()
    );

    let shown = dataset.head(args.count);
    for (image, label) in shown.images.rows().into_iter().zip(shown.labels.iter()) {
        println!("Training: {label}");
        print!("{}", mnist::render(image, args.threshold));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn bare_invocation_trains_with_default_hyperparameters() {
        let cli = Cli::parse_from(["mnist-logreg"]);

        assert!(cli.command.is_none());
        assert_eq!(cli.train.config(), TrainConfig::default());
        assert_eq!(cli.train.layout(), SplitLayout::default());
    }

    #[test]
    fn train_subcommand_overrides() {
        let cli = Cli::parse_from([
            "mnist-logreg",
            "train",
            "--data",
            "other.gz",
            "--seed",
            "3",
            "--patience",
            "40",
            "--no-progress",
        ]);

        let Some(Command::Train(args)) = cli.command else {
            panic!("expected train subcommand");
        };
        assert_eq!(args.data, PathBuf::from("other.gz"));
        assert_eq!(args.seed, Some(3));
        assert_eq!(args.config().patience, 40);
        assert!(!args.config().progress);
    }

    #[test]
    fn pack_requires_sources() {
        assert!(Cli::try_parse_from(["mnist-logreg", "pack"]).is_err());

        let cli = Cli::parse_from([
            "mnist-logreg",
            "pack",
            "--images",
            "i.gz",
            "--labels",
            "l.gz",
        ]);
        let Some(Command::Pack(args)) = cli.command else {
            panic!("expected pack subcommand");
        };
        assert_eq!(args.count, 1200);
    }
}
