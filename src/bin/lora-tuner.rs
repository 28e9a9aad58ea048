//! lora-tuner CLI — inject, fuse and persist low-rank adapters
//!
//! Commands:
//!   lora-tuner demo [dir]   — inject adapters into a toy model, fuse, save, reload
//!   lora-tuner inspect <id> — show the config and tensors of a saved adapter

use lora_tuner::graph::{Activation, LayerNorm, Linear, Model, Sequential};
use lora_tuner::storage::{self, HubCache, CONFIG_NAME, WEIGHTS_NAME};
use lora_tuner::{Capabilities, LoraConfig, LoraModel, ModuleGraph};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::env;

const DEFAULT_DEMO_DIR: &str = "lora-demo";

fn print_usage() {
    println!(
        r#"
Usage: lora-tuner <command> [options]

Commands:
  demo     [dir]   Inject adapters into a toy fused-qkv model, fuse them for
                   inference, save to <dir> (default: {DEFAULT_DEMO_DIR}) and reload
  inspect  <id>    Show a saved adapter; <id> is a directory or a hub cache id

Environment:
  LORA_TUNER_HUB_CACHE   Hub cache root used when <id> is not a local directory
  RUST_LOG               Log filter (default: info)
"#
    );
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let result = match args[1].as_str() {
        "demo" => cmd_demo(&args[2..]),
        "inspect" => cmd_inspect(&args[2..]),
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("  Error: {}", e);
        std::process::exit(1);
    }
}

/// 16-wide encoder with a fused qkv projection and a plain output head
fn toy_model(seed: u64) -> Model {
    let mut rng = StdRng::seed_from_u64(seed);
    let attn = Sequential::new()
        .with("c_attn", Linear::conv1d(16, 48, true, &mut rng))
        .with("act", Activation::Gelu)
        .with("c_proj", Linear::new(48, 16, true, &mut rng));
    let head = Sequential::new()
        .with("ln", LayerNorm::new(16))
        .with("out", Linear::new(16, 16, true, &mut rng));
    Model::new(Sequential::new().with("attn", attn).with("head", head)).with_name("toy/fused-qkv-16")
}

fn cmd_demo(args: &[String]) -> lora_tuner::Result<()> {
    let dir = args.first().map(String::as_str).unwrap_or(DEFAULT_DEMO_DIR);
    let caps = Capabilities::detect();

    println!("\n  [1/4] Injecting adapters into query and value of attn.c_attn");
    let config = LoraConfig {
        rank: 4,
        alpha: 16,
        dropout: 0.05,
        fan_in_fan_out: true,
        merge_weights: true,
        enable_lora: Some(vec![true, false, true]),
        ..LoraConfig::for_targets(["c_attn"])
    };
    let mut lora = LoraModel::new(config, toy_model(0), caps)?;
    lora.print_trainable_parameters();

    // stand-in for optimizer steps
    for (name, param) in lora.model_mut().named_parameters_mut() {
        if name.ends_with("lora_B.weight") {
            let (r, c) = param.shape();
            param.value = DMatrix::new_random(r, c) * 0.1;
        }
    }

    let x = DMatrix::from_fn(4, 16, |i, j| ((i * 16 + j) as f64 * 0.1).cos());
    lora.eval()?;
    let fused = lora.forward(&x)?;
    lora.train()?;
    lora.eval()?;
    let refused = lora.forward(&x)?;
    println!(
        "  [2/4] Fused forward, unmerge + re-merge drift: {:.3e}",
        (&fused - &refused).norm()
    );

    println!("  [3/4] Saving adapter to {}", dir);
    lora.save_pretrained(dir)?;

    let mut restored = LoraModel::from_pretrained(toy_model(0), dir, caps, None)?;
    restored.eval()?;
    let reloaded = restored.forward(&x)?;
    println!(
        "  [4/4] Reloaded onto a fresh base model, output drift: {:.3e}",
        (&fused - &reloaded).norm()
    );
    Ok(())
}

fn cmd_inspect(args: &[String]) -> lora_tuner::Result<()> {
    let Some(identifier) = args.first() else {
        eprintln!("Usage: lora-tuner inspect <dir-or-id>");
        return Ok(());
    };
    let cache = HubCache::from_env();

    let config = LoraConfig::from_pretrained(identifier, Some(&cache))?;
    println!("\n  {} ({})", identifier, CONFIG_NAME);
    println!("  {}", "-".repeat(60));
    println!("{}", serde_json::to_string_pretty(&config.to_json_value(false)?)?);

    let weights = storage::resolve_artifact(identifier, WEIGHTS_NAME, Some(&cache))?;
    let state = storage::load_state_dict(&weights)?;
    let total: usize = state.values().map(|m| m.len()).sum();
    println!("\n  {} tensors, {} values ({})", state.len(), total, WEIGHTS_NAME);
    println!("  {}", "-".repeat(60));
    for (name, m) in &state {
        println!("  {:<40} {}x{}  |x|={:.4}", name, m.nrows(), m.ncols(), m.norm());
    }
    Ok(())
}
