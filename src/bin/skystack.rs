// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::time::Duration;

use log::{error, info};
use pico_args::Arguments;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry, EnvFilter};
use tracing_appender::{non_blocking::NonBlockingBuilder};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use skystack::acquisition_controller::{AcquisitionConfig, AcquisitionController};
use skystack::archive_client::{HlaArchiveClient, HlaQueryParams, ProductType};
use skystack_elements::astro_util::{LocationSampler, VisitedLocations};
use skystack_elements::stacker_trait::MeanStacker;

struct AppArgs {
    output_dir: String,
    num_images: usize,
    radius: f64,
    instrument: String,
    product: ProductType,
    min_exposures: usize,
    timeout: Duration,
    max_attempts: Option<u32>,
    all_sky: bool,
    log_dir: String,
    log_file: String,
}

fn parse_duration(arg: &str) -> Result<Duration, std::num::ParseFloatError> {
    let seconds = arg.parse()?;
    Ok(Duration::from_secs_f64(seconds))
}

// A flag that was given but does not parse is an error, never the default.
fn flag_or<T>(value: Result<Option<T>, pico_args::Error>, name: &str, default: T)
              -> Result<T, String> {
    match value {
        Ok(Some(v)) => Ok(v),
        Ok(None) => Ok(default),
        Err(e) => Err(format!("Bad {}: {}", name, e)),
    }
}

fn parse_args(mut pargs: Arguments) -> Result<AppArgs, String> {
    let product: String = flag_or(
        pargs.opt_value_from_str("--product"), "--product", "exposure".to_string())?;
    let product = product.parse::<ProductType>().map_err(|e| e.message)?;
    let max_attempts = pargs.opt_value_from_str("--max_attempts")
        .map_err(|e| format!("Bad --max_attempts: {}", e))?;
    let args = AppArgs {
        output_dir: flag_or(pargs.opt_value_from_str("--output_dir"),
                            "--output_dir", "./images".to_string())?,
        num_images: flag_or(pargs.opt_value_from_str("--num_images"),
                            "--num_images", 1)?,
        radius: flag_or(pargs.opt_value_from_str("--radius"),
                        "--radius", 0.4)?,
        instrument: flag_or(pargs.opt_value_from_str("--instrument"),
                            "--instrument", "WFC3".to_string())?,
        product,
        min_exposures: flag_or(pargs.opt_value_from_str("--min_exposures"),
                               "--min_exposures", 5)?,
        timeout: flag_or(pargs.opt_value_from_fn("--timeout", parse_duration),
                         "--timeout", Duration::from_secs(300))?,
        max_attempts,
        all_sky: pargs.contains("--all_sky"),
        log_dir: flag_or(pargs.opt_value_from_str("--log_dir"),
                         "--log_dir", ".".to_string())?,
        log_file: flag_or(pargs.opt_value_from_str("--log_file"),
                          "--log_file", "skystack_log.txt".to_string())?,
    };
    let remaining = pargs.finish();
    if !remaining.is_empty() {
        return Err(format!("Unexpected arguments: {:?}", remaining));
    }
    Ok(args)
}

fn main() {
    const HELP: &str = "\
    FLAGS:
      -h, --help                     Prints help information
      --all_sky                      Save one exposure per archive location instead
                                     of stacking at random locations

    OPTIONS:
      --output_dir <path>            ./images
      --num_images NUMBER            1
      --radius DEGREES               0.4
      --instrument <name>            WFC3
      --product <type>               exposure
      --min_exposures NUMBER         5
      --timeout SECONDS              300
      --max_attempts NUMBER          unlimited
      --log_dir <path>               .
      --log_file <file>              skystack_log.txt
    ";

    let mut pargs = Arguments::from_env();
    if pargs.contains(["-h", "--help"]) {
        println!("{}", HELP);
        std::process::exit(0);
    }
    let args = match parse_args(pargs) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(2);
        }
    };

    // Set up logging.
    let file_appender = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&args.log_file)
        .max_log_files(10)
        .build(&args.log_dir)
    {
        Ok(appender) => appender,
        Err(e) => {
            eprintln!("Cannot log to {}: {:?}", args.log_dir, e);
            std::process::exit(1);
        }
    };

    // Create non-blocking writers for both the file and stdout
    let (non_blocking_file, file_guard) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(file_appender);
    let (non_blocking_stdout, stdout_guard) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());
    registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking_stdout))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
        .init();

    let config = AcquisitionConfig{
        output_dir: PathBuf::from(&args.output_dir),
        search_radius_deg: args.radius,
        product_type: args.product,
        instrument: args.instrument.clone(),
        min_exposures: args.min_exposures,
        max_attempts_per_image: args.max_attempts,
        ..Default::default()
    };
    let archive = HlaArchiveClient::new(HlaQueryParams{
        timeout: args.timeout,
        ..Default::default()
    });
    let mut controller = match AcquisitionController::new(
        config, Box::new(archive), Box::new(MeanStacker::new()), LocationSampler::new())
    {
        Ok(controller) => controller,
        Err(e) => {
            error!("Bad configuration: {}", e.message);
            std::process::exit(1);
        }
    };

    let result = if args.all_sky {
        controller.all_sky_survey(args.product).map(|outputs| outputs.len())
    } else {
        let mut visited = VisitedLocations::new();
        controller.run(args.num_images, &mut visited).map(|summary| summary.outputs.len())
    };
    match result {
        Ok(count) => info!("Wrote {} images to {}", count, args.output_dir),
        Err(e) => {
            error!("Acquisition failed: {}", e.message);
            drop(file_guard);
            drop(stdout_guard);
            std::process::exit(1);
        }
    }
}

// mod tests.
