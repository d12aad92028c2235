//! Matrix-engine descriptor compiler CLI
//!
//! Usage:
//!   mmedesc job.json
//!   mmedesc job.json --chip gen2 --pattern SrqO --hex
//!   cat job.json | mmedesc --json

use clap::Parser as ClapParser;
use colored::Colorize;
use std::fs;
use std::io::{self, Read};

use mme_desc::{ActivationKind, ChipGen, DescriptorProgram, Job, ReductionOrder};

#[derive(ClapParser, Debug)]
#[command(name = "mmedesc")]
#[command(author = "FPGA Team")]
#[command(version = "0.1.0")]
#[command(about = "Compiles matrix-engine operations to AGU descriptors")]
struct Args {
    /// JSON job file (reads stdin when omitted)
    #[arg(value_name = "JOB")]
    job_file: Option<String>,

    /// Override the chip generation of the job
    #[arg(short = 'c', long = "chip")]
    chip: Option<ChipGen>,

    /// Override the reduction order (e.g. "SrqO")
    #[arg(short = 'p', long = "pattern", value_parser = parse_pattern)]
    pattern: Option<ReductionOrder>,

    /// Override the largest common-dim window of one activation
    #[arg(long = "max-cd-window")]
    max_cd_window: Option<u64>,

    /// Output as JSON
    #[arg(short = 'j', long = "json")]
    json_output: bool,

    /// Output the encoded descriptors as hex words
    #[arg(long = "hex")]
    hex_output: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn parse_pattern(s: &str) -> Result<ReductionOrder, String> {
    ReductionOrder::ALL
        .iter()
        .find(|order| order.to_string().eq_ignore_ascii_case(s))
        .copied()
        .ok_or_else(|| format!("Unknown reduction order: {}", s))
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let source = if let Some(file) = &args.job_file {
        fs::read_to_string(file).unwrap_or_else(|e| {
            eprintln!("{}: Failed to read file '{}': {}", "Error".red(), file, e);
            std::process::exit(1);
        })
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer).unwrap_or_else(|e| {
            eprintln!("{}: Failed to read stdin: {}", "Error".red(), e);
            std::process::exit(1);
        });
        buffer
    };

    let mut job = match Job::from_json(&source) {
        Ok(job) => job,
        Err(e) => {
            eprintln!("{}: {}", "Job error".red(), e);
            std::process::exit(1);
        }
    };
    if let Some(chip) = args.chip {
        job.chip = chip;
    }
    if let Some(pattern) = args.pattern {
        job.strategy.pattern = pattern;
    }
    if args.max_cd_window.is_some() {
        job.strategy.max_cd_window = args.max_cd_window;
    }

    if args.verbose {
        println!("{}", "MME Descriptor Compiler".bold().blue());
        println!("{}", "=".repeat(35));
        println!();
        println!("{}: {}", "Operation".green(), job.operation.op);
        println!("{}: {}", "Target".green(), job.chip);
        println!("{}: {}", "Pattern".green(), job.strategy.pattern);
        println!();
    }

    let program = match job.compile() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}: {}", "Compilation error".red(), e);
            std::process::exit(1);
        }
    };

    if args.json_output {
        match program.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("{}: Failed to serialize to JSON: {}", "Error".red(), e);
                std::process::exit(1);
            }
        }
    } else if args.hex_output {
        match program.to_hex_dump() {
            Ok(hex) => print!("{}", hex),
            Err(e) => {
                eprintln!("{}: Failed to encode descriptors: {}", "Error".red(), e);
                std::process::exit(1);
            }
        }
    } else {
        print_program(&program, args.verbose);
    }
}

fn print_program(program: &DescriptorProgram, verbose: bool) {
    println!("{}", "Compilation Results".bold().green());
    println!("{}", "=".repeat(50));
    println!();

    let geo = &program.target.strategy.geometry;
    println!("{}: {}", "Target".cyan(), program.target.chip);
    println!(
        "{}: {} unit(s), {} core(s), {}x{} ports",
        "Geometry".cyan(),
        geo.num_mmes(),
        geo.num_cores(),
        geo.fcd_ports,
        geo.sp_ports
    );
    println!("{}: {}", "Operation".cyan(), program.op);
    println!("{}: {}", "Sub-problems".cyan(), program.num_sub_problems);
    println!("{}: {}", "Activations".cyan(), program.activations.len());
    println!("{}: {}", "Descriptors".cyan(), program.total_descriptors);
    println!();

    if verbose || program.activations.len() <= 8 {
        println!("{}", "Activation Details".bold().yellow());
        println!("{}", "-".repeat(50));

        for activation in &program.activations {
            println!();
            println!("{} {}", "Activation".bold(), activation.id.to_string().bold());
            println!("  {}: {}", "Description".cyan(), activation.description);
            let kind = match activation.kind {
                ActivationKind::Memset => "memset".yellow(),
                ActivationKind::Compute => "compute".green(),
                ActivationKind::Accumulate => "accumulate".blue(),
            };
            println!("  {}: {}", "Kind".cyan(), kind);
            println!("  {}: {}", "Padded cd".cyan(), activation.agu.padded_cd);
            println!("  {}: {}", "Loop iterations".cyan(), activation.agu.loops.iterations());

            if verbose {
                for desc in &activation.descriptors {
                    println!("  {} {}: {:?}", "Core".cyan(), desc.core, desc.header);
                }
            }
        }
    } else {
        println!("({} activations, use -v for details)", program.activations.len());
    }
}
