use rust_pretrain::common::Config;
use rust_pretrain::data::{Dataset, ElectraDataset, Example, SpecialTokens};
use rust_pretrain::drivers::{load_tokenizer, pretrain_electra, ElectraTrainingConfig};
use rust_pretrain::electra::{
    mask_with_tokens, select_mask_subset, ElectraMaskingConfig, ReformerElectra,
};
use rust_pretrain::reformer::ReformerHyperparameters;
use rust_tokenizers::tokenizer::Tokenizer;
use std::fs;
use std::path::Path;
use tch::{nn, Device, Kind, Tensor};

const VOCAB: &[&str] = &[
    "[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]", "the", "a", "cat", "dog", "sat", "ran", "on",
    "under", "mat", "table", "and", "slept", ".",
];

const SENTENCES: &[&str] = &[
    "the cat sat on the mat .",
    "a dog ran .",
    "the dog slept on a mat and the cat ran under the table .",
    "a cat sat under a table .",
];

fn write_corpus(dir: &Path) -> anyhow::Result<()> {
    fs::write(dir.join("vocab.txt"), VOCAB.join("\n"))?;
    let mut text = String::new();
    for i in 0..40 {
        text.push_str(SENTENCES[i % SENTENCES.len()]);
        text.push_str("\n\n");
    }
    fs::write(dir.join("corpus.txt"), &text)?;
    Ok(())
}

fn tiny_model(dim: i64) -> ReformerHyperparameters {
    ReformerHyperparameters {
        dim,
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
fn test_electra_dataset_encoding() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_corpus(dir.path())?;
    let tokenizer = load_tokenizer(&dir.path().join("vocab.txt"), false)?;
    let special_tokens = SpecialTokens::from_vocab(tokenizer.vocab());
    let dataset = ElectraDataset::from_path(&tokenizer, 8, dir.path().join("corpus.txt"))?;
    // blank lines are skipped
    assert_eq!(dataset.len(), 40);

    match dataset.get(1)? {
        // [CLS] a dog ran . [SEP] [PAD] [PAD]
        Example::Sequence(tokens) => {
            assert_eq!(tokens.len(), 8);
            assert_eq!(tokens[0], special_tokens.cls);
            assert_eq!(tokens[5], special_tokens.sep);
            assert_eq!(&tokens[6..], &[special_tokens.pad, special_tokens.pad]);
        }
        other => panic!("unexpected example {:?}", other),
    }
    match dataset.get(2)? {
        // truncated to the maximum length, still closed by [SEP]
        Example::Sequence(tokens) => {
            assert_eq!(tokens.len(), 8);
            assert_eq!(tokens[7], special_tokens.sep);
        }
        other => panic!("unexpected example {:?}", other),
    }
    Ok(())
}

#[test]
fn test_masking_skips_special_tokens() {
    tch::manual_seed(9);
    let special_ids = [0i64, 1, 2, 3, 4];
    let input_ids = Tensor::of_slice(&[
        2i64, 5, 7, 9, 11, 5, 13, 17, 15, 8, 10, 3, 0, 0, 0, 0, //
        2, 6, 8, 10, 17, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    ])
    .view((2, 16));
    let allowed = mask_with_tokens(&input_ids, &special_ids).logical_not();
    for _ in 0..20 {
        let selected = select_mask_subset(&allowed, 0.15);
        let counts = selected.sum_dim_intlist(&[-1], false, Kind::Int64);
        // ceil(10 * 0.15) = 2, ceil(4 * 0.15) = 1
        assert_eq!(counts.int64_value(&[0]), 2);
        assert_eq!(counts.int64_value(&[1]), 1);
        let special_selected = selected
            .logical_and(&allowed.logical_not())
            .sum(Kind::Int64)
            .int64_value(&[]);
        assert_eq!(special_selected, 0);
    }
}

#[test]
fn test_reformer_electra_forward_backward() -> anyhow::Result<()> {
    //    Set-up model
    tch::manual_seed(9);
    let special_tokens = SpecialTokens {
        pad: 0,
        unk: 1,
        cls: 2,
        sep: 3,
        mask: 4,
    };
    let vocab_size = VOCAB.len() as i64;
    let generator_config = tiny_model(16).to_config(vocab_size, 8, &special_tokens, false)?;
    let discriminator_config = tiny_model(32).to_config(vocab_size, 8, &special_tokens, false)?;
    let vs = nn::VarStore::new(Device::Cpu);
    let model = ReformerElectra::new(
        &vs.root(),
        &generator_config,
        &discriminator_config,
        special_tokens,
        ElectraMaskingConfig {
            random_token_prob: 0.5,
            ..Default::default()
        },
    )?;

    //    Forward and backward pass
    let input_ids = Tensor::of_slice(&[
        2i64, 5, 7, 9, 11, 13, 17, 3, //
        2, 6, 8, 10, 17, 3, 0, 0,
    ])
    .view((2, 8));
    let output = model.forward_t(&input_ids, true)?;
    let loss = output.loss.double_value(&[]);
    let mlm_loss = output.mlm_loss.double_value(&[]);
    let disc_loss = output.disc_loss.double_value(&[]);
    assert!(loss.is_finite());
    assert!((loss - (mlm_loss + 50.0 * disc_loss)).abs() < 1e-3 * loss.abs().max(1.0));
    assert!(output.generator_accuracy.is_none());
    assert!(output.discriminator_accuracy.is_none());

    let eval_output = tch::no_grad(|| model.forward_t(&input_ids, false))?;
    assert!((0.0..=1.0).contains(&eval_output.generator_accuracy.unwrap()));
    assert!((0.0..=1.0).contains(&eval_output.discriminator_accuracy.unwrap()));

    output.loss.backward();
    let generator_grads = vs
        .variables()
        .iter()
        .filter(|(name, _)| name.starts_with("generator_head"))
        .filter(|(_, tensor)| tensor.grad().defined())
        .count();
    assert_eq!(generator_grads, 2);
    Ok(())
}

#[test]
fn test_pretrain_electra_end_to_end() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_corpus(dir.path())?;
    let config_path = dir.path().join("electra-train.json");
    let config = serde_json::json!({
        "train": {
            "vocab_path": dir.path().join("vocab.txt"),
            "data_path": dir.path().join("corpus.txt"),
            "checkpoint_path": dir.path().join("checkpoints"),
            "log_dir": dir.path().join("logs"),
            "max_len": 8,
            "batch_size": 4,
            "epochs": 1,
            "log_steps": 3,
            "ckpt_steps": 4,
            "progress_bar": false
        },
        "generator": {"dim": 16, "depth": 2, "heads": 2, "dim_head": 8, "ff_mult": 2, "bucket_size": 4, "num_hashes": 2},
        "discriminator": {"dim": 32, "depth": 2, "heads": 2, "dim_head": 8, "ff_mult": 2, "bucket_size": 4, "num_hashes": 2}
    });
    fs::write(&config_path, serde_json::to_string_pretty(&config)?)?;

    let config = ElectraTrainingConfig::from_file(&config_path)?;
    let summary = pretrain_electra(&config, &[Device::Cpu], 9)?;
    // 36 training samples in batches of 4
    assert_eq!(summary.train_steps, 9);
    assert_eq!(summary.optimizer_steps, 9);
    assert_eq!(summary.eval.unwrap().num_batches, 1);

    assert!(dir.path().join("logs").join("electra_eval_results.txt").is_file());
    assert!(dir.path().join("checkpoints").join("electra.ot").is_file());
    Ok(())
}
