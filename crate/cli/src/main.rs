use std::process;

use hsm_keys_cli::hsm_keys_main;

fn main() {
    if let Some(err) = hsm_keys_main().err() {
        eprintln!("ERROR: {err}");
        process::exit(1);
    }
}
