use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::lottery::DEFAULT_WINNING_NUMBER;

/// Lottery round between a server and its agencies
#[derive(Parser, Debug)]
#[command(name = "lottery", version, about)]
pub struct Cli {
    /// Log level, used when RUST_LOG is not set
    #[arg(long, env = "LOTTERY_LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Collect the bets of every agency and announce the winners
    Serve(ServeArgs),

    /// Submit an agency's bets and ask for its winners
    Agency(AgencyArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "LOTTERY_LISTEN", default_value = "0.0.0.0:12345")]
    pub listen: SocketAddr,

    /// Size of the listen backlog
    #[arg(long, env = "LOTTERY_BACKLOG", default_value_t = 5)]
    pub backlog: u32,

    /// Directory holding one `agency-<id>.csv` file per expected agency
    #[arg(long, env = "LOTTERY_DATA_DIR", default_value = "/data")]
    pub data_dir: PathBuf,

    /// Number of expected agencies, overrides counting the agency files
    #[arg(long, env = "LOTTERY_AGENCIES")]
    pub agencies: Option<usize>,

    /// File the received bets are stored in
    #[arg(long, env = "LOTTERY_STORE", default_value = "bets.csv")]
    pub store: PathBuf,

    /// The number every winning bet was placed on
    #[arg(long, env = "LOTTERY_WINNING_NUMBER", default_value_t = DEFAULT_WINNING_NUMBER)]
    pub winning_number: u32,

    /// Seconds to wait for connections to close on shutdown
    #[arg(long, env = "LOTTERY_SHUTDOWN_TIMEOUT", default_value_t = 5)]
    pub shutdown_timeout: u64,
}

#[derive(Args, Debug, Clone)]
pub struct AgencyArgs {
    /// The agency's identifier
    #[arg(long, env = "CLI_ID")]
    pub id: String,

    /// Address of the lottery server
    #[arg(long, env = "CLI_SERVER_ADDRESS", default_value = "server:12345")]
    pub server: String,

    /// The agency's bets, defaults to `/data/agency-<id>.csv`
    #[arg(long, env = "CLI_BETS_FILE")]
    pub bets: Option<PathBuf>,

    /// Maximum number of bets sent in a single batch
    #[arg(long, env = "CLI_BATCH_MAXAMOUNT", default_value_t = 100)]
    pub batch_max_amount: usize,
}

impl AgencyArgs {
    pub fn bets_file(&self) -> PathBuf {
        self.bets
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/data/agency-{}.csv", self.id)))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;

    use super::{Cli, Command};

    #[test]
    fn check_serve_arguments() {
        let cli = Cli::try_parse_from([
            "lottery",
            "--log-level",
            "debug",
            "serve",
            "--listen",
            "127.0.0.1:4000",
            "--agencies",
            "5",
            "--winning-number",
            "1234",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "debug");
        let Command::Serve(args) = cli.command else {
            panic!("expected the serve command");
        };
        assert_eq!(args.listen, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(args.agencies, Some(5));
        assert_eq!(args.winning_number, 1234);
        assert_eq!(args.backlog, 5);
        assert_eq!(args.shutdown_timeout, 5);
    }

    #[test]
    fn check_agency_arguments() {
        let cli = Cli::try_parse_from(["lottery", "agency", "--id", "3", "--server", "localhost:4000"])
            .unwrap();

        let Command::Agency(args) = cli.command else {
            panic!("expected the agency command");
        };
        assert_eq!(args.id, "3");
        assert_eq!(args.server, "localhost:4000");
        assert_eq!(args.bets_file(), PathBuf::from("/data/agency-3.csv"));
    }

    #[test]
    fn agency_requires_an_id() {
        assert!(Cli::try_parse_from(["lottery", "agency"]).is_err());
    }
}
