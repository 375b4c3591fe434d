//! CLI command definitions

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "trainrelay")]
#[command(about = "Run training jobs and relay their progress over a pub/sub broker", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Broker WebSocket endpoint
    #[arg(long, env = "RELAY_URL", global = true)]
    pub relay_url: Option<String>,

    /// Channel to log to and read from
    #[arg(long, env = "RELAY_CHANNEL", global = true)]
    pub channel: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a command, bracketing it with status lines on the channel
    ///
    /// Examples:
    ///   trainrelay run -- python main.py --epochs 2
    ///   trainrelay --channel detector_logs run -- sh -c 'sleep 5'
    Run {
        /// Working directory for the command
        #[arg(long)]
        cwd: Option<String>,

        /// Program and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Print the channel history, oldest first
    Logs,

    /// Issue a broker token
    ///
    /// Examples:
    ///   trainrelay token --subject 42
    ///   trainrelay token --subject 42 --for-channel training_logs
    Token {
        /// Token subject (user id)
        #[arg(long, env = "RELAY_SUBJECT")]
        subject: String,

        /// Issue a subscription token for this channel instead of a connection token
        #[arg(long = "for-channel")]
        for_channel: Option<String>,
    },

    /// Send one plugin command and print the JSON response
    ///
    /// Examples:
    ///   trainrelay dispatch train --kwargs '{"project_id": 7, "epochs": 5}' --wait
    ///   trainrelay dispatch logs
    Dispatch {
        /// Command name: train, status, logs, stop, tensorboard, predict, toolbar
        command: String,

        /// Keyword arguments as a JSON object
        #[arg(long, value_parser = parse_kwargs, default_value = "{}")]
        kwargs: serde_json::Map<String, serde_json::Value>,

        /// For `train`, block until the job finishes; otherwise it ends with this process
        #[arg(long)]
        wait: bool,
    },
}

fn parse_kwargs(s: &str) -> Result<serde_json::Map<String, serde_json::Value>, String> {
    match serde_json::from_str(s) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err("kwargs must be a JSON object".to_string()),
        Err(e) => Err(format!("Invalid kwargs JSON: {}", e)),
    }
}
