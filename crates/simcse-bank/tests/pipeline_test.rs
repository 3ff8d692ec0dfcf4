//! End-to-end contrastive and sentence-embedding passes with the lookup encoder.

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{VarBuilder, VarMap};
use simcse_bank::training::loss::tensor_to_f32;
use simcse_bank::{
    ContrastiveModel, Encoder, EncoderOutput, ForwardRequest, LookupEncoder, LookupEncoderConfig,
    MemoryBank, ModelArgs, ModelOutput, Pooler, PoolerType, TokenBatch,
};

const HIDDEN: usize = 12;
const VOCAB: usize = 64;

fn build(args: &ModelArgs) -> (ContrastiveModel<LookupEncoder>, VarMap) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let encoder = LookupEncoder::new(
        LookupEncoderConfig {
            vocab_size: VOCAB,
            hidden_size: HIDDEN,
            num_layers: 3,
            max_position_embeddings: 32,
            ..LookupEncoderConfig::default()
        },
        vb.pp("encoder"),
    )
    .expect("encoder");
    let model = ContrastiveModel::new(encoder, args.clone(), vb).expect("model");
    (model, varmap)
}

fn pairs(batch: usize, views: usize, seq: usize, offset: usize) -> TokenBatch {
    let n = batch * views * seq;
    let ids: Vec<u32> = (0..n).map(|i| ((i * 5 + offset) % VOCAB) as u32).collect();
    TokenBatch::new(
        Tensor::from_vec(ids, (batch, views, seq), &Device::Cpu).expect("ids"),
        Tensor::ones((batch, views, seq), DType::U32, &Device::Cpu).expect("mask"),
    )
    .expect("batch")
}

#[test]
fn four_pair_avg_scenario() {
    let args = ModelArgs::from_toml_str(&format!(
        "pooler_type = \"avg\"\ntemp = 0.05\nbank_size = 16\nhidden_len = {}\n",
        HIDDEN
    ))
    .expect("config");
    let (model, _vm) = build(&args);
    let mut bank = MemoryBank::from_args(&args, &Device::Cpu).expect("bank");

    let out = model
        .forward(ForwardRequest::contrastive(&pairs(4, 2, 8, 0)), &mut bank, None)
        .expect("forward")
        .into_contrastive()
        .expect("named output");

    let loss = tensor_to_f32(&out.loss).expect("loss");
    println!("\n=== 4-pair avg scenario ===");
    println!("logits: {:?}", out.logits.dims());
    println!("loss:   {:.4}", loss);

    assert_eq!(out.logits.dims(), &[4, 4]);
    assert_eq!(out.labels.to_vec1::<u32>().expect("labels"), vec![0, 1, 2, 3]);
    assert!(loss >= 0.0 && loss.is_finite());
    assert_eq!(bank.ptr(), 0, "no auxiliary branch, bank untouched");
}

#[test]
fn identical_views_score_lower_than_mismatched_views() {
    let args = ModelArgs {
        pooler_type: PoolerType::Avg,
        hidden_len: HIDDEN,
        bank_size: 16,
        ..ModelArgs::default()
    };
    let (model, _vm) = build(&args);
    let mut bank = MemoryBank::from_args(&args, &Device::Cpu).expect("bank");

    // view 1 repeats view 0 exactly
    let base = pairs(4, 1, 6, 3);
    let same = TokenBatch::new(
        Tensor::cat(&[&base.input_ids, &base.input_ids], 1).expect("ids"),
        Tensor::cat(&[&base.attention_mask, &base.attention_mask], 1).expect("mask"),
    )
    .expect("batch");

    // view 1 is view 0 rotated by one example
    let rotated = Tensor::cat(
        &[
            base.input_ids.narrow(0, 1, 3).expect("tail"),
            base.input_ids.narrow(0, 0, 1).expect("head"),
        ],
        0,
    )
    .expect("rotated");
    let shuffled = TokenBatch::new(
        Tensor::cat(&[&base.input_ids, &rotated], 1).expect("ids"),
        Tensor::cat(&[&base.attention_mask, &base.attention_mask], 1).expect("mask"),
    )
    .expect("batch");

    let loss_of = |batch: &TokenBatch, bank: &mut MemoryBank| {
        let out = model
            .cl_forward(batch, None, bank, None, Some(true))
            .expect("forward")
            .into_contrastive()
            .expect("named output");
        tensor_to_f32(&out.loss).expect("loss")
    };
    let aligned = loss_of(&same, &mut bank);
    let scrambled = loss_of(&shuffled, &mut bank);
    println!("aligned {:.4} scrambled {:.4}", aligned, scrambled);
    assert!(aligned < scrambled);
}

#[test]
fn repeated_stronger_steps_cycle_the_bank() {
    let args = ModelArgs {
        pooler_type: PoolerType::Cls,
        hidden_len: HIDDEN,
        bank_size: 6,
        do_stronger: true,
        cutoff_rate: 0.2,
        ..ModelArgs::default()
    };
    let (model, _vm) = build(&args);
    let mut bank = MemoryBank::from_args(&args, &Device::Cpu).expect("bank");

    let mut ptrs = Vec::new();
    for step in 0..4 {
        let out = model
            .cl_forward(&pairs(2, 3, 6, step), None, &mut bank, None, None)
            .expect("forward")
            .into_contrastive()
            .expect("named output");
        assert!(out.bank_loss.is_some());
        ptrs.push(bank.ptr());
    }
    assert_eq!(ptrs, vec![2, 4, 0, 2]);
}

#[test]
fn sentence_embedding_matches_pooling_of_the_same_view() {
    for pooler_type in PoolerType::all().iter().copied() {
        let args = ModelArgs {
            pooler_type,
            hidden_len: HIDDEN,
            mlp_only_train: true,
            ..ModelArgs::default()
        };
        let (model, _vm) = build(&args);
        let view = pairs(3, 2, 7, 1).view(1).expect("view");

        let embedded = match model
            .sentemb_forward(&view, Some(true))
            .expect("sentemb")
        {
            ModelOutput::SentenceEmbedding(out) => out.pooler_output,
            other => panic!("unexpected output {:?}", other),
        };

        let needs_layers = pooler_type.needs_hidden_states();
        let outputs: EncoderOutput = model
            .encoder()
            .encode(&view.as_encoder_input(needs_layers), None)
            .expect("encode");
        let pooled = Pooler::new(pooler_type)
            .forward(&view.attention_mask, &outputs)
            .expect("pool");

        let diff = embedded
            .sub(&pooled)
            .and_then(|d| d.abs())
            .and_then(|d| d.sum_all())
            .expect("diff");
        assert!(tensor_to_f32(&diff).expect("scalar") < 1e-5, "{}", pooler_type);
        assert_eq!(embedded.dims(), &[3, HIDDEN]);
    }
}

#[test]
fn avg_pooling_with_single_real_token_returns_that_token() {
    let args = ModelArgs {
        pooler_type: PoolerType::Avg,
        hidden_len: HIDDEN,
        ..ModelArgs::default()
    };
    let (model, _vm) = build(&args);

    let ids = Tensor::from_vec((0..10u32).collect::<Vec<_>>(), (2, 5), &Device::Cpu).expect("ids");
    let mask = Tensor::from_vec(
        vec![0u32, 0, 1, 0, 0, 1, 0, 0, 0, 0],
        (2, 5),
        &Device::Cpu,
    )
    .expect("mask");
    let batch = TokenBatch::new(ids, mask).expect("batch");

    let outputs = model
        .encoder()
        .encode(&batch.as_encoder_input(false), None)
        .expect("encode");
    let embedded = model.embed(&batch).expect("embed");

    let expected_first = outputs.last_hidden_state.i((0, 2)).expect("row 0 token 2");
    let expected_second = outputs.last_hidden_state.i((1, 0)).expect("row 1 token 0");
    let got: Vec<Vec<f32>> = embedded.to_vec2().expect("rows");
    let want_first: Vec<f32> = expected_first.to_vec1().expect("vec");
    let want_second: Vec<f32> = expected_second.to_vec1().expect("vec");

    for (g, w) in got[0].iter().zip(want_first.iter()) {
        assert!((g - w).abs() < 1e-6);
    }
    for (g, w) in got[1].iter().zip(want_second.iter()) {
        assert!((g - w).abs() < 1e-6);
    }
}

#[test]
fn token_type_ids_travel_with_each_view() {
    let args = ModelArgs {
        pooler_type: PoolerType::Avg,
        hidden_len: HIDDEN,
        bank_size: 4,
        ..ModelArgs::default()
    };
    let (model, _vm) = build(&args);
    let mut bank = MemoryBank::from_args(&args, &Device::Cpu).expect("bank");

    let batch = pairs(2, 2, 4, 0)
        .with_token_type_ids(Tensor::zeros((2, 2, 4), DType::U32, &Device::Cpu).expect("tt"))
        .expect("batch");
    let out = model
        .cl_forward(&batch, None, &mut bank, None, Some(false))
        .expect("forward");
    assert_eq!(out.into_tuple().map(|t| t.len()), Some(2));
}
