use rust_pretrain::common::Config;
use rust_pretrain::data::{
    Dataset, DatasetForAutoRegressive, Example, SpecialTokens, IGNORE_INDEX,
};
use rust_pretrain::drivers::{load_tokenizer, pretrain_autoregressive, AutoRegressiveConfig};
use rust_pretrain::reformer::{ReformerAutoRegressiveModel, ReformerHyperparameters};
use rust_tokenizers::tokenizer::Tokenizer;
use rust_tokenizers::vocab::Vocab;
use std::fs;
use std::path::Path;
use tch::{nn, Device, Tensor};

const VOCAB: &[&str] = &[
    "[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]", "the", "a", "cat", "dog", "sat", "ran", "on",
    "under", "mat", "table", "and", "slept", ".",
];

const SENTENCES: &[&str] = &[
    "the cat sat on the mat .",
    "a dog ran under the table .",
    "the dog slept on a mat and the cat ran .",
    "a cat sat under a table .",
];

fn write_corpus(dir: &Path) -> anyhow::Result<()> {
    fs::write(dir.join("vocab.txt"), VOCAB.join("\n"))?;
    let corpus = dir.join("corpus");
    fs::create_dir_all(&corpus)?;
    let mut text = String::new();
    for i in 0..40 {
        text.push_str(SENTENCES[i % SENTENCES.len()]);
        text.push('\n');
    }
    fs::write(corpus.join("part-0.txt"), &text)?;
    fs::write(corpus.join("part-1.txt"), &text)?;
    fs::write(corpus.join("ignored.json"), "{}")?;
    Ok(())
}

fn tiny_model() -> ReformerHyperparameters {
    ReformerHyperparameters {
        dim: 16,
        depth: 2,
        heads: 2,
        dim_head: 8,
        ff_mult: 2,
        bucket_size: 4,
        num_hashes: 2,
        ..Default::default()
    }
}

#[test]
fn test_dataset_blocks_are_shifted() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_corpus(dir.path())?;
    let tokenizer = load_tokenizer(&dir.path().join("vocab.txt"), false)?;
    let dataset = DatasetForAutoRegressive::from_directory(&tokenizer, 8, dir.path().join("corpus"))?;
    assert!(dataset.len() > 10);

    let sep = tokenizer.vocab().token_to_id("[SEP]");
    match dataset.get(0)? {
        Example::Pair { input, label } => {
            assert_eq!(input.len(), 8);
            assert_eq!(label.len(), 8);
            assert_eq!(&input[1..], &label[..7]);
            // "the cat sat on the mat ." followed by the document separator
            assert_eq!(input[7], sep);
        }
        other => panic!("unexpected example {:?}", other),
    }
    assert!(dataset.get(dataset.len()).is_err());
    Ok(())
}

#[test]
fn test_causal_model_forward() -> anyhow::Result<()> {
    //    Set-up model
    let dir = tempfile::tempdir()?;
    write_corpus(dir.path())?;
    let tokenizer = load_tokenizer(&dir.path().join("vocab.txt"), false)?;
    let special_tokens = SpecialTokens::from_vocab(tokenizer.vocab());
    let config = tiny_model().to_config(VOCAB.len() as i64, 8, &special_tokens, true)?;
    let vs = nn::VarStore::new(Device::Cpu);
    let model = ReformerAutoRegressiveModel::new(&vs.root(), &config)?;

    //    Forward pass
    let input_ids = Tensor::of_slice(&[5i64, 7, 9, 11, 5, 13, 17, 3, 6, 8, 10, 12, 5, 14, 0, 0])
        .view((2, 8));
    let labels = Tensor::of_slice(&[
        7i64, 9, 11, 5, 13, 17, 3, 5, 8, 10, 12, 5, 14, IGNORE_INDEX, IGNORE_INDEX, IGNORE_INDEX,
    ])
    .view((2, 8));
    let (logits, loss) = model.forward_t(&input_ids, Some(&labels), false)?;

    assert_eq!(logits.size(), vec![2, 8, VOCAB.len() as i64]);
    let loss = loss.unwrap().double_value(&[]);
    assert!(loss.is_finite() && loss > 0.0);

    let encoder_config = tiny_model().to_config(VOCAB.len() as i64, 8, &special_tokens, false)?;
    assert!(ReformerAutoRegressiveModel::new(&vs.root() / "encoder", &encoder_config).is_err());
    Ok(())
}

#[test]
fn test_pretrain_autoregressive_end_to_end() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_corpus(dir.path())?;
    let config_path = dir.path().join("autoregressive-pretrain.json");
    let config = serde_json::json!({
        "vocab_path": dir.path().join("vocab.txt"),
        "data_path": dir.path().join("corpus"),
        "checkpoint_path": dir.path().join("checkpoints"),
        "model_name": "tiny-reformer",
        "log_dir": dir.path().join("logs"),
        "max_seq_len": 8,
        "dim": 16,
        "depth": 2,
        "n_head": 2,
        "dim_head": 8,
        "ff_mult": 2,
        "bucket_size": 4,
        "num_hashes": 2,
        "batch_size": 4,
        "epochs": 1,
        "log_steps": 2,
        "ckpt_steps": 5,
        "gradient_accumulation_steps": 2,
        "progress_bar": false
    });
    fs::write(&config_path, serde_json::to_string_pretty(&config)?)?;

    let config = AutoRegressiveConfig::from_file(&config_path)?;
    let summary = pretrain_autoregressive(&config, &[Device::Cpu], 9)?;
    assert!(summary.train_steps > 0);
    assert_eq!(
        summary.optimizer_steps,
        (summary.train_steps / 2) as i64
    );
    let eval = summary.eval.unwrap();
    assert!(eval.loss.is_finite());

    let logs = dir.path().join("logs");
    assert!(logs.join("tiny-reformer_train_results.json").is_file());
    assert!(logs.join("tiny-reformer_eval_results.txt").is_file());
    let checkpoints = dir.path().join("checkpoints");
    assert!(checkpoints.join("tiny-reformer.ot").is_file());
    assert!(checkpoints.join("tiny-reformer_optimizer.ot").is_file());
    assert!(checkpoints.join("tiny-reformer_state.json").is_file());

    //    Running again resumes from the final checkpoint without further training
    let resumed = pretrain_autoregressive(&config, &[Device::Cpu], 9)?;
    assert_eq!(resumed.resumed_from, Some((1, summary.train_steps)));
    assert_eq!(resumed.train_steps, summary.train_steps);
    assert!(resumed.eval.is_none());
    Ok(())
}
