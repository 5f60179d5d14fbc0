/// Initialize tracing. `RUST_LOG` wins; otherwise the config's debug level
/// becomes the default directive.
pub fn init(level: &str) {
    let directive = format!("lobsterbridge={}", level.to_ascii_lowercase());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().unwrap_or_else(|_| {
                    "lobsterbridge=info".parse().expect("static directive parses")
                })),
        )
        .init();
}
