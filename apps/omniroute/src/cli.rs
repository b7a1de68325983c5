use clap::Parser;

#[derive(Parser)]
#[command(name = "omniroute", about = "Local AI routing gateway")]
pub(crate) struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    pub(crate) host: String,
    #[arg(long, default_value_t = 8787)]
    pub(crate) port: u16,
    /// JSON file holding the machine record (providers, aliases, combos,
    /// api keys).
    #[arg(long, default_value = "omniroute.json")]
    pub(crate) config: String,
    /// Machine id the config file is registered under.
    #[arg(long, default_value = "local")]
    pub(crate) machine_id: String,
    /// Secret for api-key checksums.
    #[arg(long, env = "OMNIROUTE_SECRET", default_value = "dev-secret")]
    pub(crate) server_secret: String,
    /// Outbound HTTP(S) proxy.
    #[arg(long)]
    pub(crate) proxy: Option<String>,
}
