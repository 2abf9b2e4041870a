use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "scry", version, about = "Tool bridge for virtual tabletop automation")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Bridge stdin/stdout to the backend, spawning it if needed
    Serve,

    /// Check whether the backend is reachable
    Ping,

    /// Show backend status: version, PID, gateway, queue
    Status,

    /// Start the backend if it is not already running
    Start,

    /// Stop the backend gracefully
    Stop,

    /// List the tool catalogue
    Tools,

    /// Invoke one tool and print its output
    Call {
        /// Tool name, e.g. generate-map
        name: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
}
