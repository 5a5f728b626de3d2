use anyhow::Result;
use clap::Parser;

use crate::vision::{StreamCliArgs, StreamConfig};

/// Stream a network camera through an object detector as annotated MJPEG.
#[derive(Debug, Parser)]
#[command(name = "detect-stream", version, about)]
struct Cli {
    #[command(flatten)]
    stream: StreamCliArgs,
}

/// Parse process arguments and environment into a validated configuration.
pub fn parse_config() -> Result<StreamConfig> {
    StreamConfig::try_from(Cli::parse().stream)
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
