//! Command-line argument dispatch and server initialization.
//!
//! This module parses validated CLI arguments and maps them to the appropriate
//! action, such as starting the API server with its full configuration state.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{
    ARG_DSN, ARG_FRONTEND_URL, ARG_ISSUER, ARG_PORT, ARG_SESSION_TTL, ARG_SIGNING_KEY,
};
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;
    let frontend_base_url = matches
        .get_one::<String>(ARG_FRONTEND_URL)
        .cloned()
        .context("missing required argument: --frontend-url")?;
    let issuer = matches
        .get_one::<String>(ARG_ISSUER)
        .cloned()
        .context("missing required argument: --issuer")?;

    Ok(Action::Server(Args {
        port,
        dsn,
        frontend_base_url,
        issuer,
        signing_key_path: matches.get_one::<String>(ARG_SIGNING_KEY).cloned(),
        session_ttl_seconds: matches.get_one::<i64>(ARG_SESSION_TTL).copied(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::actions::Action;

    #[test]
    fn dsn_required() {
        temp_env::with_vars([("ATESTI_DSN", None::<&str>)], || {
            let command = crate::cli::commands::new();
            let result = command.try_get_matches_from(vec!["atesti"]);
            assert!(result.is_err());
        });
    }

    #[test]
    fn handler_maps_server_args() {
        temp_env::with_vars(
            [
                ("ATESTI_DSN", Some("postgres://localhost/atesti")),
                ("ATESTI_PORT", Some("9000")),
                ("ATESTI_SESSION_TTL_SECONDS", Some("3600")),
            ],
            || {
                let command = crate::cli::commands::new();
                let matches = command.get_matches_from(vec!["atesti"]);
                let action = handler(&matches);
                assert!(action.is_ok());
                if let Ok(Action::Server(args)) = action {
                    assert_eq!(args.port, 9000);
                    assert_eq!(args.dsn, "postgres://localhost/atesti");
                    assert_eq!(args.session_ttl_seconds, Some(3600));
                }
            },
        );
    }
}
