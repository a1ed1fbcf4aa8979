fn main() {
    if let Err(err) = cc_executor::cli::run_cc_executor() {
        tracing::error!(error = %err, "cc-executor failed");
        std::process::exit(1);
    }
}
