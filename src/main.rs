//! Ember entry point.

fn main() {
    std::process::exit(ember::cli::run_cli());
}
