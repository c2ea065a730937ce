use std::fs;

use candle_core::Device;
use finetune::{
    build_codec, load_chunks, BigramModel, ChunkSampler, FinetuneConfig, LanguageModel,
    StopReason, TrainingController,
};
use tempfile::tempdir;

#[test]
fn smoke_finetune_writes_samples_and_checkpoints() {
    let tmp = tempdir().expect("tempdir");
    let base = tmp.path();

    let corpus = (0..32)
        .map(|i| format!("line {i}: the quick brown fox jumps over the lazy dog"))
        .collect::<Vec<_>>();
    let train_dir = base.join("train");
    fs::create_dir_all(&train_dir).unwrap();
    fs::write(train_dir.join("a.txt"), corpus[..16].join("\n")).unwrap();
    fs::write(train_dir.join("b.txt"), corpus[16..].join("\n")).unwrap();
    fs::write(base.join("val.txt"), corpus.join("\n")).unwrap();

    let config_path = base.join("finetune.toml");
    fs::write(
        &config_path,
        r#"
run_name = "smoke"

[data]
dataset = ["train"]
valset = ["val.txt"]

[model]
context_window = 32

[training]
batch_size = 2
batch_length = 16
stop_after = 31
save_every = 10
validate_every = 5

[sampling]
sample_every = 10
sample_length = 12
sample_num = 2

[runtime.logging]
enable_stdout = false
"#,
    )
    .unwrap();

    let config = FinetuneConfig::from_path(&config_path).unwrap();
    let codec = build_codec(config.data.tokenizer_json.as_deref()).unwrap();
    let train_chunks = load_chunks(&config.data.dataset, codec.as_ref()).unwrap();
    assert_eq!(train_chunks.len(), 2);
    let train = ChunkSampler::new(train_chunks).unwrap();
    let val = ChunkSampler::new(load_chunks(&config.data.valset, codec.as_ref()).unwrap()).unwrap();

    let model = BigramModel::new(
        codec.vocab_size(),
        config.model.context_window,
        config.training.seed,
        &Device::Cpu,
    )
    .unwrap();
    let held_out = train.chunks()[0][..16].to_vec();
    let initial_loss = model
        .loss(&[&held_out[..]])
        .unwrap()
        .to_vec0::<f32>()
        .unwrap();

    let checkpoint_dir = config.run_checkpoint_dir();
    let sample_dir = config.run_sample_dir();
    let mut controller = TrainingController::new(config, model, codec, train, val).unwrap();
    controller.resume().unwrap();
    assert_eq!(controller.run().unwrap(), StopReason::BudgetReached);
    assert_eq!(controller.state().counter, 31);

    for counter in [10, 20, 30] {
        let text = fs::read_to_string(sample_dir.join(format!("samples-{counter}"))).unwrap();
        assert!(text.starts_with("======== SAMPLE 1 ========\n"));
        assert!(text.contains("======== SAMPLE 2 ========\n"));
    }

    assert!(checkpoint_dir.join("step_000000000010").join("model.safetensors").is_file());
    assert!(checkpoint_dir.join("counter").is_file());
    assert!(controller.state().best_val_loss().is_finite());

    let final_loss = controller
        .model()
        .loss(&[&held_out[..]])
        .unwrap()
        .to_vec0::<f32>()
        .unwrap();
    assert!(final_loss < initial_loss, "{final_loss} >= {initial_loss}");
}
