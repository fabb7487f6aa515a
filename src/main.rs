fn main() {
    if let Err(err) = ledger_import::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
