fn main() {
    if let Err(err) = btcnode::run_entry() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
