fn main() {
    if let Err(err) = rmn_loader::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
