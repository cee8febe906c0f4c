use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{error, info};
use transmamba_data::{BatchLoader, DataModule};
use transmamba_model::params::parameter_layout;
use transmamba_model::{GenerationConfig, ParameterTree, PartitionRules, load_config, run_generation};

/// Define the init subcommand.
fn init_subcommand() -> Command {
    Command::new("init")
        .about("Initialize random model parameters and write them as safetensors")
        .arg(Arg::new("config").help("Preset name or json::<file>").required(true).index(1))
        .arg(
            Arg::new("OUTPUT_DIR")
                .help("Directory receiving model.safetensors and config.json")
                .required(true)
                .index(2),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("Initialization seed")
                .default_value("0")
                .value_parser(clap::value_parser!(u64)),
        )
}

/// Define the generate subcommand.
fn generate_subcommand() -> Command {
    Command::new("generate")
        .about("Sample a continuation of a token id prompt")
        .arg(
            Arg::new("prompt")
                .help("Comma or space separated prompt token ids")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("STRING")
                .help("Preset name or json::<file> [default: debug]"),
        )
        .arg(
            Arg::new("checkpoint")
                .long("checkpoint")
                .value_name("DIR")
                .help("Directory of safetensors files; random parameters when omitted"),
        )
        .arg(
            Arg::new("temperature")
                .short('t')
                .long("temperature")
                .value_name("FLOAT")
                .help("Temperature for sampling in [0, inf], 0 is greedy")
                .default_value("1.0")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("topp")
                .short('p')
                .long("topp")
                .value_name("FLOAT")
                .help("Top-p for nucleus sampling in (0,1]")
                .default_value("0.9")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("max-new-tokens")
                .short('n')
                .long("max-new-tokens")
                .value_name("INT")
                .help("Number of tokens to generate")
                .default_value("32")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("context")
                .short('c')
                .long("context")
                .value_name("INT")
                .help("Maximum sequence length, (default) = the configured one")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("Random seed for parameters and sampling")
                .value_parser(clap::value_parser!(u64)),
        )
}

/// Define the partition subcommand.
fn partition_subcommand() -> Command {
    Command::new("partition")
        .about("Print the mesh placement of every parameter")
        .arg(Arg::new("config").help("Preset name or json::<file>").required(true).index(1))
        .arg(
            Arg::new("checkpoint")
                .long("checkpoint")
                .value_name("DIR")
                .help("List the parameters of a checkpoint instead of the configured layout"),
        )
}

/// Define the dataset subcommand.
fn dataset_subcommand() -> Command {
    Command::new("dataset")
        .about("Inspect the train/val shards under a data directory")
        .arg(Arg::new("ROOT").help("Directory holding train/ and val/ shards").required(true).index(1))
        .arg(
            Arg::new("max-seq-len")
                .long("max-seq-len")
                .value_name("INT")
                .default_value("2048")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("pad-id")
                .long("pad-id")
                .value_name("INT")
                .default_value("0")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("batch-size")
                .short('b')
                .long("batch-size")
                .value_name("INT")
                .default_value("8")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("show")
                .long("show")
                .value_name("INDEX")
                .help("Print the training example at this global index (repeatable)")
                .action(ArgAction::Append)
                .value_parser(clap::value_parser!(usize)),
        )
}

fn parse_token_ids(raw: &str) -> Result<Vec<u32>> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<u32>().with_context(|| format!("Invalid token id '{part}'")))
        .collect()
}

/// Run the init command with the provided arguments
fn run_init_command(matches: &ArgMatches) -> Result<()> {
    let config_path = matches.get_one::<String>("config").context("config is required")?;
    let output_dir = Path::new(matches.get_one::<String>("OUTPUT_DIR").context("OUTPUT_DIR is required")?);
    let seed = matches.get_one::<u64>("seed").copied().unwrap_or_default();

    let config = load_config(config_path)?;
    let params = ParameterTree::init_random(&config, seed)?;

    fs::create_dir_all(output_dir).with_context(|| format!("Failed to create {}", output_dir.display()))?;
    params.save_safetensors(&output_dir.join("model.safetensors"))?;

    let config_file = output_dir.join("config.json");
    fs::write(&config_file, config.to_json_string()?)
        .with_context(|| format!("Failed to write {}", config_file.display()))?;

    info!("Initialized {} parameters from '{config_path}' with seed {seed}", params.len());
    info!("Load them with --config json::{} --checkpoint {}", config_file.display(), output_dir.display());
    Ok(())
}

/// Run the generate command with the provided arguments
fn run_generate_command(matches: &ArgMatches) -> Result<()> {
    let prompt = matches.get_one::<String>("prompt").context("prompt is required")?;

    let config = GenerationConfig::builder()
        .model_config(matches.get_one::<String>("config"))
        .checkpoint_path(matches.get_one::<String>("checkpoint"))
        .prompt_ids(Some(parse_token_ids(prompt)?))
        .temperature(matches.get_one::<f32>("temperature").copied())
        .top_p(matches.get_one::<f32>("topp").copied())
        .max_new_tokens(matches.get_one::<usize>("max-new-tokens").copied())
        .max_sequence_length(matches.get_one::<usize>("context").copied())
        .seed(matches.get_one::<u64>("seed").copied())
        .build()
        .map_err(|e| anyhow::anyhow!(e))?;

    let tokens = run_generation(config).map_err(|e| anyhow::anyhow!("Generation failed: {e:#}"))?;
    println!("{}", tokens.iter().map(u32::to_string).collect::<Vec<_>>().join(" "));
    Ok(())
}

/// Run the partition command with the provided arguments
fn run_partition_command(matches: &ArgMatches) -> Result<()> {
    let config = load_config(matches.get_one::<String>("config").context("config is required")?)?;
    let rules = PartitionRules::new(config.scan_layers, config.param_scan_axis)?;

    let layout = match matches.get_one::<String>("checkpoint") {
        Some(dir) => ParameterTree::load_safetensors(Path::new(dir))?
            .iter()
            .map(|(name, tensor)| (name.to_string(), tensor.shape().to_vec()))
            .collect(),
        None => parameter_layout(&config),
    };

    for (name, shape) in &layout {
        println!("{name}\t{shape:?}\t{}", rules.resolve(name));
    }
    info!("{} parameters", layout.len());
    Ok(())
}

/// Run the dataset command with the provided arguments
fn run_dataset_command(matches: &ArgMatches) -> Result<()> {
    let root = matches.get_one::<String>("ROOT").context("ROOT is required")?;
    let max_seq_len = matches.get_one::<usize>("max-seq-len").copied().unwrap_or(2048);
    let pad_id = matches.get_one::<u32>("pad-id").copied().unwrap_or_default();
    let batch_size = matches.get_one::<usize>("batch-size").copied().unwrap_or(8);

    let module = DataModule::setup(root, max_seq_len, pad_id, batch_size)?;
    for (split, dataset) in [("train", &module.train), ("val", &module.val)] {
        let batches = BatchLoader::new(dataset, batch_size, None, true)?.num_batches();
        println!(
            "{split}: {} examples in {} shards, {batches} batches of {batch_size}",
            dataset.len(),
            dataset.index().shard_count()
        );
    }

    for &idx in matches.get_many::<usize>("show").into_iter().flatten() {
        let example = module.train.get(idx)?;
        let used = example.tokens.iter().rposition(|&id| id != pad_id).map_or(0, |last| last + 1);
        let weighted = example.weights.iter().filter(|&&w| w > 0.0).count();
        println!("#{idx} [{}] {weighted} weighted targets: {:?}", example.dataset, &example.tokens[..used]);
    }
    Ok(())
}

fn execute_commands() -> Result<()> {
    // Initialize logger with clean format (no timestamp/module prefix)
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();

    let matches = Command::new("transmamba")
        .about("Transmamba CLI: hybrid attention/state-space language model tools")
        .subcommand(init_subcommand())
        .subcommand(generate_subcommand())
        .subcommand(partition_subcommand())
        .subcommand(dataset_subcommand())
        .get_matches();

    match matches.subcommand() {
        Some(("init", matches)) => run_init_command(matches),
        Some(("generate", matches)) => run_generate_command(matches),
        Some(("partition", matches)) => run_partition_command(matches),
        Some(("dataset", matches)) => run_dataset_command(matches),
        _ => anyhow::bail!("No subcommand specified. Use -h to print help information."),
    }
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}
