fn main() {
    if let Err(err) = charge_orchestrator::app::run() {
        eprintln!("application startup failed: {err}");
        std::process::exit(1);
    }
}
