use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tapevault")]
#[command(
    about = "Present a tape library as a filesystem namespace with write-back migration to tape"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Run the migration engine against the tape library")]
    Serve,
    #[command(about = "Rebuild the catalog by scanning every tape's embedded index")]
    Reindex,
    #[command(about = "Show catalog, cache and tape status")]
    Status {
        #[arg(long, help = "JSON output")]
        json: bool,
    },
    #[command(about = "Manage configuration")]
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    #[command(about = "Show current configuration values")]
    Show,
    #[command(about = "Open config file in editor")]
    Edit,
    #[command(about = "Show config file path")]
    Path,
}
