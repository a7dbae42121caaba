//! Command line and environment configuration.
//!
//! Every serve option can come from a flag or from the environment; flags
//! win. With no subcommand the binary serves.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use alpaca_engine::SamplingConfig;
use alpaca_runtime::{Backend, TinyModelConfig};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::queue::QueueConfig;
use crate::state::ServerConfig;

pub const DEFAULT_MODEL_PATH: &str = "model/alpaca-tiny.safetensors";

#[derive(Debug, Parser)]
#[command(name = "alpaca-server", version, about = "Serve an instruction-following model over HTTP")]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

impl Cli {
    /// The chosen subcommand, defaulting to `serve`.
    pub fn into_command(self) -> Command {
        self.command.unwrap_or(Command::Serve(self.serve))
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load the model and serve `/answer`.
    Serve(ServeArgs),
    /// Write a randomly initialised tiny model artifact.
    InitModel(InitModelArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    Tiny,
    Scripted,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Tiny => Backend::Tiny,
            BackendArg::Scripted => Backend::Scripted,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Safetensors model artifact.
    #[arg(long, env = "MODEL_PATH", default_value = DEFAULT_MODEL_PATH)]
    pub model_path: PathBuf,

    #[arg(long, env = "MODEL_BACKEND", value_enum, default_value_t = BackendArg::Tiny)]
    pub backend: BackendArg,

    #[arg(long, env = "HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    #[arg(long, short, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Sessions admitted at once, the running one included.
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 16, value_parser = parse_capacity)]
    pub queue_capacity: usize,

    /// Wall-clock limit per request, in seconds.
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 120)]
    pub request_timeout_secs: u64,

    /// Token budget per request.
    #[arg(long, default_value_t = 128)]
    pub n_predict: usize,

    #[arg(long, default_value_t = 0.2)]
    pub temperature: f32,

    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

impl ServeArgs {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            capacity: self.queue_capacity,
            ..QueueConfig::default()
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            sampling: SamplingConfig::default()
                .with_n_predict(self.n_predict)
                .with_temperature(self.temperature)
                .with_seed(self.seed),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct InitModelArgs {
    /// Where to write the artifact.
    #[arg(long, short, default_value = DEFAULT_MODEL_PATH)]
    pub output: PathBuf,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, default_value_t = 32)]
    pub d_model: usize,

    #[arg(long, default_value_t = 64)]
    pub d_ff: usize,
}

impl InitModelArgs {
    pub fn model_config(&self) -> TinyModelConfig {
        TinyModelConfig {
            d_model: self.d_model,
            d_ff: self.d_ff,
            ..TinyModelConfig::default()
        }
    }
}

fn parse_capacity(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("capacity must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_flags_parse() {
        let cli = Cli::try_parse_from([
            "alpaca-server",
            "serve",
            "--model-path",
            "/tmp/m.safetensors",
            "--backend",
            "scripted",
            "--host",
            "127.0.0.1",
            "--port",
            "8081",
            "--queue-capacity",
            "5",
            "--request-timeout-secs",
            "7",
        ])
        .unwrap();

        let Command::Serve(args) = cli.into_command() else {
            panic!("expected serve");
        };
        assert_eq!(args.model_path, PathBuf::from("/tmp/m.safetensors"));
        assert_eq!(args.backend, BackendArg::Scripted);
        assert_eq!(args.addr(), "127.0.0.1:8081".parse().unwrap());
        assert_eq!(args.queue_config().capacity, 5);
        assert_eq!(args.server_config().request_timeout, Duration::from_secs(7));
    }

    #[test]
    fn top_level_flags_mean_serve() {
        let cli = Cli::try_parse_from(["alpaca-server", "--port", "9000"]).unwrap();
        let Command::Serve(args) = cli.into_command() else {
            panic!("expected serve");
        };
        assert_eq!(args.port, 9000);
    }

    #[test]
    fn zero_capacity_rejected() {
        let res = Cli::try_parse_from(["alpaca-server", "serve", "--queue-capacity", "0"]);
        assert!(res.is_err());
    }

    #[test]
    fn init_model_parses() {
        let cli = Cli::try_parse_from([
            "alpaca-server",
            "init-model",
            "--output",
            "out.safetensors",
            "--d-model",
            "8",
        ])
        .unwrap();
        let Command::InitModel(args) = cli.into_command() else {
            panic!("expected init-model");
        };
        assert_eq!(args.output, PathBuf::from("out.safetensors"));
        assert_eq!(args.model_config().d_model, 8);
        assert_eq!(args.model_config().d_ff, 64);
    }

    #[test]
    fn sampling_defaults_match_engine() {
        let cli = Cli::try_parse_from(["alpaca-server", "serve"]).unwrap();
        let Command::Serve(args) = cli.into_command() else {
            panic!("expected serve");
        };
        assert_eq!(args.server_config().sampling, SamplingConfig::default());
    }
}
