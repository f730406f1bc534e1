extern crate either;
extern crate rust_hptm;

use either::*;
use std::env::args;
use std::process;

use rust_hptm::{logging, Config, Result, Trainer};
use rust_hptm::def::LOG_SUFFIX;

fn run(args: &[String]) -> Result<()> {
    let config = match Config::from_args(args)? {
        Left(config) => config,
        Right(usage) => {
            print!("{}", usage);
            return Ok(());
        }
    };
    let log_file = if config.outputs.log {
        Some(config.output(LOG_SUFFIX))
    } else {
        None
    };
    logging::init(config.verbosity, log_file.as_ref().map(|p| p.as_path()))?;

    let mut trainer = Trainer::new(config)?;
    let summary = trainer.run()?;
    if let Some(train) = summary.train {
        println!("train {}", train);
    }
    if let Some(test) = summary.test {
        println!("test {}", test);
    }
    Ok(())
}

fn main() {
    let args: Vec<String> = args().collect();
    let program = args.get(0).cloned().unwrap_or_else(|| "hptm".to_owned());
    if let Err(e) = run(&args) {
        eprintln!("{}: {}", program, e);
        process::exit(e.exit_code());
    }
}
