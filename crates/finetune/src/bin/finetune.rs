use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use candle_core::Device;
use clap::Parser;
use finetune::{
    build_codec, config::DeviceKind, load_chunks, BigramModel, ChunkSampler, FinetuneConfig,
    FinetuneError, RestoredWeights, StopReason, TrainingController,
};
use serde_json::{Number, Value};

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("finetuning failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Fine-tune a language model with Adafactor", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to finetuning config file")]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, value_name = "NAME", help = "Run name for checkpoints and samples")]
    run_name: Option<String>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), FinetuneError> {
    let args = Args::parse();

    let mut config = FinetuneConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    if let Some(run_name) = args.run_name {
        config.run_name = run_name;
    }
    config.validate()?;

    let device = match config.runtime.device {
        DeviceKind::Cpu => Device::Cpu,
        DeviceKind::Cuda => Device::cuda_if_available(0)?,
    };

    let codec = build_codec(config.data.tokenizer_json.as_deref())?;
    log::info!("loading dataset");
    let train_sampler = ChunkSampler::new(load_chunks(&config.data.dataset, codec.as_ref())?)?;
    log::info!("loading validation dataset");
    let val_sampler = ChunkSampler::new(load_chunks(&config.data.valset, codec.as_ref())?)?;

    let vocab_size = config.model.vocab_size.unwrap_or_else(|| codec.vocab_size());
    let model = BigramModel::new(
        vocab_size,
        config.model.context_window,
        config.training.seed,
        &device,
    )?;

    let mut controller =
        TrainingController::new(config, model, codec, train_sampler, val_sampler)?;

    let outcome = controller.resume()?;
    match &outcome.restored {
        RestoredWeights::Checkpoint(dir) => println!("restored checkpoint {}", dir.display()),
        RestoredWeights::Pretrained(path) => println!("loaded pretrained weights {}", path.display()),
        RestoredWeights::Initial => println!("starting from initial weights"),
    }

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| FinetuneError::runtime(format!("failed to install signal handler: {err}")))?;

    let reason = controller.run_with_shutdown(|| shutdown_flag.load(Ordering::Relaxed))?;
    let counter = controller.state().counter;
    match reason {
        StopReason::BudgetReached => println!("reached iteration budget at {counter}"),
        StopReason::EarlyStop => println!(
            "stopped at {counter}: validation loss did not improve (best {:.4})",
            controller.state().best_val_loss()
        ),
        StopReason::Interrupted => println!("interrupted at {counter}"),
    }

    Ok(())
}

fn apply_overrides(
    config: FinetuneConfig,
    overrides: &[OverrideArg],
) -> Result<FinetuneConfig, FinetuneError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        FinetuneError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        FinetuneError::ConfigFormat(format!("failed to apply overrides: {err}"))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

#[derive(Debug)]
struct PathSegment {
    key: String,
    index: Option<usize>,
}

fn set_value_at_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), FinetuneError> {
    let segments = parse_path(path)?;
    if segments.is_empty() {
        return Err(FinetuneError::runtime("override path must not be empty"));
    }
    assign_at_path(value, &segments, new_value)
}

fn parse_path(path: &str) -> Result<Vec<PathSegment>, FinetuneError> {
    path.split('.')
        .map(|segment| match segment.split_once('[') {
            Some((base, idx_part)) => {
                let index = idx_part.trim_end_matches(']').parse::<usize>().map_err(|err| {
                    FinetuneError::runtime(format!(
                        "invalid index in override path '{segment}': {err}"
                    ))
                })?;
                Ok(PathSegment {
                    key: base.to_string(),
                    index: Some(index),
                })
            }
            None => Ok(PathSegment {
                key: segment.to_string(),
                index: None,
            }),
        })
        .collect()
}

fn assign_at_path(
    target: &mut Value,
    segments: &[PathSegment],
    new_value: Value,
) -> Result<(), FinetuneError> {
    let Some((segment, rest)) = segments.split_first() else {
        *target = new_value;
        return Ok(());
    };

    if target.is_null() {
        *target = Value::Object(serde_json::Map::new());
    }
    let map = target.as_object_mut().ok_or_else(|| {
        FinetuneError::runtime(format!(
            "override path segment '{}' points to non-object value",
            segment.key
        ))
    })?;
    let entry = map.entry(segment.key.clone()).or_insert(Value::Null);

    match segment.index {
        Some(array_index) => {
            if entry.is_null() {
                *entry = Value::Array(Vec::new());
            }
            let array = entry.as_array_mut().ok_or_else(|| {
                FinetuneError::runtime(format!(
                    "override path segment '{}' expects array value",
                    segment.key
                ))
            })?;
            while array.len() <= array_index {
                array.push(Value::Null);
            }
            assign_at_path(&mut array[array_index], rest, new_value)
        }
        None => assign_at_path(entry, rest, new_value),
    }
}
