use clap::Parser;

/// This is the staff control program for a single-station voting kiosk.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// (file path) The kiosk description in JSON format: the contested positions in
    /// ballot order, the key bindings, the staff PIN and the optional file locations.
    #[clap(short, long, value_parser)]
    pub config: String,

    /// (directory path, optional) Where the vote tables and the session roster are
    /// kept. Defaults to the directory of the configuration file.
    #[clap(short, long, value_parser)]
    pub data_dir: Option<String>,

    /// If passed, read key names from the standard input and print the bound
    /// candidate for each of them, without arming a session or writing any file.
    #[clap(long, takes_value = false)]
    pub test_keyboard: bool,

    /// If passed as an argument, will turn on verbose logging to the standard output.
    #[clap(long, takes_value = false)]
    pub verbose: bool,
}
