//! Operator console commands read from stdin

use std::time::Instant;

use dundi_core::{show, Dundi, Eid, DEFAULT_CONTEXT};

pub const HELP: &str = "\
Commands:
  show peers | show peer <eid> | show trans | show requests
  show mappings | show precache | show entityid | show metrics
  lookup <number>[@context] [bypass]
  precache <number>[@context]
  query <eid>[@context]
  flush [stats]
  debug on|off
  reload
  quit
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    ShowPeers,
    ShowPeer(Eid),
    ShowTrans,
    ShowRequests,
    ShowMappings,
    ShowPrecache,
    ShowEntityId,
    ShowMetrics,
    Lookup {
        number: String,
        context: String,
        bypass: bool,
    },
    Precache {
        number: String,
        context: String,
    },
    Query {
        eid: Eid,
        context: String,
    },
    Flush {
        stats: bool,
    },
    Debug(bool),
    Reload,
    Quit,
    Help,
}

/// Split `what@context`, defaulting the context
fn split_context(arg: &str) -> (String, String) {
    match arg.split_once('@') {
        Some((what, ctx)) if !ctx.is_empty() => (what.to_string(), ctx.to_string()),
        Some((what, _)) => (what.to_string(), DEFAULT_CONTEXT.to_string()),
        None => (arg.to_string(), DEFAULT_CONTEXT.to_string()),
    }
}

/// Parse one console line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<CliCommand>, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let cmd = match words.as_slice() {
        [] => return Ok(None),
        ["show", "peers"] => CliCommand::ShowPeers,
        ["show", "peer", eid] => {
            CliCommand::ShowPeer(eid.parse().map_err(|e| format!("{}", e))?)
        }
        ["show", "trans"] => CliCommand::ShowTrans,
        ["show", "requests"] => CliCommand::ShowRequests,
        ["show", "mappings"] => CliCommand::ShowMappings,
        ["show", "precache"] => CliCommand::ShowPrecache,
        ["show", "entityid"] => CliCommand::ShowEntityId,
        ["show", "metrics"] => CliCommand::ShowMetrics,
        ["lookup", target, rest @ ..] => {
            let bypass = match rest {
                [] => false,
                ["bypass"] => true,
                _ => return Err("usage: lookup <number>[@context] [bypass]".into()),
            };
            let (number, context) = split_context(target);
            CliCommand::Lookup { number, context, bypass }
        }
        ["precache", target] => {
            let (number, context) = split_context(target);
            CliCommand::Precache { number, context }
        }
        ["query", target] => {
            let (eid, context) = split_context(target);
            let eid = eid.parse().map_err(|e| format!("{}", e))?;
            CliCommand::Query { eid, context }
        }
        ["flush"] => CliCommand::Flush { stats: false },
        ["flush", "stats"] => CliCommand::Flush { stats: true },
        ["debug", "on"] => CliCommand::Debug(true),
        ["debug", "off"] => CliCommand::Debug(false),
        ["reload"] => CliCommand::Reload,
        ["quit"] | ["exit"] => CliCommand::Quit,
        ["help"] | ["?"] => CliCommand::Help,
        _ => return Err(format!("unknown command '{}', try 'help'", line.trim())),
    };
    Ok(Some(cmd))
}

/// Run a command that only needs the node. `Reload` and `Quit` are handled
/// by the caller.
pub fn execute(node: &Dundi, cmd: &CliCommand) -> String {
    match cmd {
        CliCommand::ShowPeers => node.show_peers(),
        CliCommand::ShowPeer(eid) => node
            .show_peer(eid)
            .unwrap_or_else(|| format!("No such peer '{}'\n", eid)),
        CliCommand::ShowTrans => node.show_trans(),
        CliCommand::ShowRequests => node.show_requests(),
        CliCommand::ShowMappings => node.show_mappings(),
        CliCommand::ShowPrecache => node.show_precache(),
        CliCommand::ShowEntityId => node.show_entityid(),
        CliCommand::ShowMetrics => node.metrics(),
        CliCommand::Lookup { number, context, bypass } => {
            let started = Instant::now();
            match node.lookup(number, context, *bypass) {
                Ok(outcome) => show::lookup_outcome(number, context, &outcome, started.elapsed().as_millis()),
                Err(e) => format!("DUNDi lookup failed: {}\n", e),
            }
        }
        CliCommand::Precache { number, context } => {
            let started = Instant::now();
            match node.precache(number, context) {
                Ok(()) => format!(
                    "DUNDi precache of '{}@{}' completed in {} ms\n",
                    number,
                    context,
                    started.elapsed().as_millis()
                ),
                Err(e) => format!("DUNDi precache failed: {}\n", e),
            }
        }
        CliCommand::Query { eid, context } => match node.query_eid(eid, context) {
            Ok(info) => show::entity(eid, info.as_ref()),
            Err(e) => format!("DUNDi entity query failed: {}\n", e),
        },
        CliCommand::Flush { stats } => match node.flush(*stats) {
            Ok(_) if *stats => "DUNDi statistics flushed\n".to_string(),
            Ok(n) => format!("DUNDi cache flushed ({} entries)\n", n),
            Err(e) => format!("Flush failed: {}\n", e),
        },
        CliCommand::Debug(on) => {
            node.set_debug(*on);
            format!("DUNDi debugging {}\n", if *on { "enabled" } else { "disabled" })
        }
        CliCommand::Help => HELP.to_string(),
        CliCommand::Reload | CliCommand::Quit => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lookup() {
        assert_eq!(
            parse("lookup 100@private bypass").unwrap(),
            Some(CliCommand::Lookup {
                number: "100".into(),
                context: "private".into(),
                bypass: true
            })
        );
        assert_eq!(
            parse("lookup 100").unwrap(),
            Some(CliCommand::Lookup {
                number: "100".into(),
                context: "e164".into(),
                bypass: false
            })
        );
        assert!(parse("lookup 100 sideways").is_err());
    }

    #[test]
    fn test_parse_query() {
        let cmd = parse("query 00:50:8b:f0:3c:11@e164").unwrap();
        assert_eq!(
            cmd,
            Some(CliCommand::Query {
                eid: "00:50:8b:f0:3c:11".parse().unwrap(),
                context: "e164".into()
            })
        );
        assert!(parse("query nonsense").is_err());
    }

    #[test]
    fn test_parse_misc() {
        assert_eq!(parse("   ").unwrap(), None);
        assert_eq!(parse("flush stats").unwrap(), Some(CliCommand::Flush { stats: true }));
        assert_eq!(parse("debug off").unwrap(), Some(CliCommand::Debug(false)));
        assert_eq!(parse("show peers").unwrap(), Some(CliCommand::ShowPeers));
        assert!(parse("show everything").is_err());
    }
}
