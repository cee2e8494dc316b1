use clap::Parser;
use log::warn;
use snafu::ErrorCompat;

mod args;
mod kiosk;

fn main() {
    let args = args::Args::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if args.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    let res = if args.test_keyboard {
        kiosk::run_keyboard_test(&args)
    } else {
        kiosk::run_kiosk(&args)
    };

    if let Err(e) = res {
        warn!("Error occurred {:?}", e);
        eprintln!("An error occurred {}", e);
        if let Some(bt) = ErrorCompat::backtrace(&e) {
            eprintln!("trace: {}", bt);
        }
        std::process::exit(1);
    }
}
