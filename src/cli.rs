use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "dlqueue")]
#[command(about = "Download files with automatic resume of partial downloads")]
#[command(long_about = "
dlqueue downloads files over HTTP(S). Files already present in the download
directory are checked against the server's size: complete files are skipped,
partial files are resumed from where they stopped.

Examples:
  dlqueue get https://example.com/big.iso
  dlqueue get -p isos https://a.example/one.iso https://b.example/two.iso
  dlqueue get -H 'Authorization: Bearer abc' https://example.com/private.bin
  dlqueue config show
")]
#[command(version)]
pub struct Cli {
    /// Override config file path
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download one or more urls
    #[command(visible_alias = "dl")]
    Get {
        /// Urls to download
        #[arg(required = true)]
        urls: Vec<String>,

        /// Download root (defaults to the configured directory)
        #[arg(short, long, value_name = "DIR")]
        output_dir: Option<String>,

        /// Subdirectory under the download root
        #[arg(short, long, value_name = "SUBPATH")]
        path: Option<String>,

        /// Extra request header, e.g. 'Referer: https://example.com'
        #[arg(short = 'H', long = "header", value_name = "HEADER")]
        headers: Vec<String>,

        /// User agent for this run
        #[arg(short = 'A', long, value_name = "AGENT")]
        user_agent: Option<String>,

        /// Give up on a download after this many seconds
        #[arg(short, long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Manage configuration
    #[command(visible_alias = "cfg")]
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show current configuration
    Show {
        /// Output format
        #[arg(short, long, value_enum, default_value = "toml")]
        format: ConfigFormat,
    },

    /// Print the config file location
    Path,

    /// Validate configuration
    Validate,

    /// Create sample configuration
    Sample,

    /// Reset configuration to defaults
    Reset {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum ConfigFormat {
    /// TOML format (default)
    Toml,
    /// JSON format
    Json,
}

impl std::fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigFormat::Toml => write!(f, "toml"),
            ConfigFormat::Json => write!(f, "json"),
        }
    }
}

impl Cli {
    /// Validate CLI arguments and show helpful error messages
    pub fn validate(&self) -> Result<(), String> {
        if let Commands::Get {
            urls,
            headers,
            timeout,
            ..
        } = &self.command
        {
            if let Some(url) = urls.iter().find(|url| url.trim().is_empty()) {
                return Err(format!("Invalid empty url {:?}", url));
            }
            if let Some(header) = headers
                .iter()
                .find(|h| dlqueue::download::headers::parse_header_line(h).is_none())
            {
                return Err(format!("Header must look like 'Name: value', got {:?}", header));
            }
            if *timeout == Some(0) {
                return Err("Timeout must be greater than 0".to_string());
            }
        }
        Ok(())
    }

    /// Config commands must work on a broken config file
    pub fn skips_config_validation(&self) -> bool {
        matches!(self.command, Commands::Config { .. })
    }
}
