//! gradpass command line driver

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gradpass::{Job, JobPassPipeline, PassResult};

#[derive(Parser)]
#[command(name = "gradpass")]
#[command(about = "Complete forward job graphs with backward and optimizer operators")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the training passes over a job file
    Complete {
        /// Forward job (JSON)
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write before/after job snapshots of every pass to this directory
        #[arg(long, value_name = "DIR")]
        dump_dir: Option<PathBuf>,
    },

    /// Print operator counts and training configuration of a job file
    Summary {
        /// Job (JSON)
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Complete {
            input,
            output,
            dump_dir,
        } => {
            let (job, result) = complete_file(&input, dump_dir)?;
            log::info!(
                "job {}: changed={} ops_added={} skipped={}",
                job.job_conf.job_name,
                result.changed,
                result.ops_added,
                result.skipped
            );
            let text = job.to_json_pretty()?;
            match output {
                Some(path) => fs::write(&path, text)
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => println!("{text}"),
            }
        }
        Commands::Summary { input } => {
            let job = Job::load(&input)?;
            print!("{}", JobSummary::new(&job));
        }
    }
    Ok(())
}

fn complete_file(input: &Path, dump_dir: Option<PathBuf>) -> Result<(Job, PassResult)> {
    let mut job = Job::load(input)?;
    let mut pipeline = JobPassPipeline::training();
    if dump_dir.is_some() {
        pipeline = pipeline.with_dump_dir(dump_dir);
    }
    let result = pipeline
        .run(&mut job)
        .with_context(|| format!("failed to complete {}", input.display()))?;
    Ok((job, result))
}

struct JobSummary {
    job_name: String,
    optimizer: Option<&'static str>,
    op_counts: BTreeMap<String, usize>,
    variables: usize,
    completed_passes: Vec<String>,
}

impl JobSummary {
    fn new(job: &Job) -> Self {
        let mut op_counts = BTreeMap::new();
        for op in &job.net {
            *op_counts.entry(op.op_type_name().to_string()).or_insert(0) += 1;
        }
        Self {
            job_name: job.job_conf.job_name.clone(),
            optimizer: job
                .job_conf
                .train_conf
                .as_ref()
                .map(|conf| conf.model_update_conf.optimizer.name()),
            variables: job.net.iter().filter(|op| op.as_variable().is_some()).count(),
            op_counts,
            completed_passes: job.helper.completed_passes.iter().cloned().collect(),
        }
    }
}

impl fmt::Display for JobSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "job: {}", self.job_name)?;
        match self.optimizer {
            Some(optimizer) => writeln!(f, "training: {optimizer}")?,
            None => writeln!(f, "training: off")?,
        }
        writeln!(f, "variables: {}", self.variables)?;
        if !self.completed_passes.is_empty() {
            writeln!(f, "completed passes: {}", self.completed_passes.join(", "))?;
        }
        writeln!(f, "ops:")?;
        for (op_type, count) in &self.op_counts {
            writeln!(f, "  {op_type:<32} {count}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gradpass::job::op_conf::{
        Initializer, InputOpConf, MatmulOpConf, ReduceSumOpConf, VariableOpConf, OUT,
    };
    use gradpass::job::{DType, LogicalBlobDesc, LogicalBlobId, OpConf, OperatorConf};
    use gradpass::train::{LrScheduleConf, ModelUpdateConf, OptimizerConf, TrainConf};

    fn linear_job() -> Job {
        let mut job = Job::default();
        job.job_conf.job_name = "linear".into();
        let ops = [
            (
                "x",
                OpConf::Input(InputOpConf {
                    shape: vec![2, 3],
                    dtype: DType::F32,
                }),
                vec![2, 3],
            ),
            (
                "w",
                OpConf::Variable(VariableOpConf::new([3, 1], Initializer::Zeros)),
                vec![3, 1],
            ),
            (
                "y",
                OpConf::Matmul(MatmulOpConf {
                    a: LogicalBlobId::new("x", OUT),
                    b: LogicalBlobId::new("w", OUT),
                    transpose_a: false,
                    transpose_b: false,
                }),
                vec![2, 1],
            ),
            (
                "loss",
                OpConf::ReduceSum(ReduceSumOpConf {
                    input: LogicalBlobId::new("y", OUT),
                    axes: vec![0, 1],
                    keepdims: false,
                }),
                vec![1],
            ),
        ];
        for (name, op_type, shape) in ops {
            job.net.push(OperatorConf::new(name, op_type));
            let desc = LogicalBlobDesc::new(shape.as_slice(), DType::F32);
            job.helper
                .lbn2logical_blob_desc
                .insert(LogicalBlobId::new(name, OUT), desc);
        }
        job.job_conf.train_conf = Some(TrainConf::new(
            vec![LogicalBlobId::new("loss", OUT)],
            ModelUpdateConf::new(OptimizerConf::adam(), LrScheduleConf::constant(0.01)),
        ));
        job
    }

    #[test]
    fn complete_writes_snapshots_and_adds_updates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("linear.json");
        fs::write(&input, linear_job().to_json_pretty().expect("serialize")).expect("write job");
        let dumps = dir.path().join("dumps");

        let (job, result) = complete_file(&input, Some(dumps.clone())).expect("complete");
        assert!(result.changed);
        assert!(job.net.iter().any(|op| op.op_type_name() == "adam_update"));
        assert!(dumps
            .join("linear-generate_backward_and_optimizer_op_confs-after.json")
            .exists());

        let summary = JobSummary::new(&job).to_string();
        assert!(summary.contains("training: adam"), "{summary}");
        assert!(summary.contains("completed passes: generate_backward_and_optimizer_op_confs"));
        assert_eq!(JobSummary::new(&job).variables, 4);
    }

    #[test]
    fn missing_input_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = complete_file(&dir.path().join("absent.json"), None).unwrap_err();
        assert!(format!("{err:#}").contains("absent.json"));
    }

    #[test]
    fn cli_parses_complete_flags() {
        let cli = Cli::try_parse_from(["gradpass", "complete", "job.json", "-o", "out.json"])
            .expect("parse");
        match cli.command {
            Commands::Complete {
                input,
                output,
                dump_dir,
            } => {
                assert_eq!(input, PathBuf::from("job.json"));
                assert_eq!(output, Some(PathBuf::from("out.json")));
                assert!(dump_dir.is_none());
            }
            Commands::Summary { .. } => panic!("expected complete"),
        }
    }
}
