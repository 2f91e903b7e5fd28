//! Line-oriented stdin console.

use std::net::SocketAddr;

use anyhow::{anyhow, bail, Context};
use murmur_net::peers::parse_addr;
use murmur_shared::PublicKey;

pub const HELP: &str = "\
commands:
  contacts                        list contacts
  add <name> <key> [host:port]    save a contact (and its address)
  forget <key>                    delete a contact and its address
  send <key> <text>               send a text message
  history <key>                   show the conversation with <key>
  read <key>                      mark the conversation read
  whoami                          print the local public key
  quit                            shut down";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Contacts,
    Add {
        name: String,
        key: PublicKey,
        addr: Option<SocketAddr>,
    },
    Forget(PublicKey),
    Send {
        key: PublicKey,
        text: String,
    },
    History(PublicKey),
    Read(PublicKey),
    WhoAmI,
    Help,
    Quit,
}

impl Command {
    /// Parse one console line. Blank lines yield `None`.
    pub fn parse(line: &str) -> anyhow::Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();

        let command = match verb {
            "contacts" => Self::Contacts,
            "add" => {
                let mut parts = rest.split_whitespace();
                let name = parts.next().ok_or_else(|| anyhow!("usage: add <name> <key> [host:port]"))?;
                let key = parse_key(parts.next())?;
                let addr = match parts.next() {
                    Some(raw) => Some(parse_addr(raw).ok_or_else(|| anyhow!("bad address: {raw}"))?),
                    None => None,
                };
                Self::Add {
                    name: name.to_string(),
                    key,
                    addr,
                }
            }
            "forget" => Self::Forget(parse_key(Some(rest))?),
            "send" => {
                let (key, text) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| anyhow!("usage: send <key> <text>"))?;
                Self::Send {
                    key: parse_key(Some(key))?,
                    text: text.trim().to_string(),
                }
            }
            "history" => Self::History(parse_key(Some(rest))?),
            "read" => Self::Read(parse_key(Some(rest))?),
            "whoami" => Self::WhoAmI,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command `{other}`, try `help`"),
        };
        Ok(Some(command))
    }
}

fn parse_key(raw: Option<&str>) -> anyhow::Result<PublicKey> {
    let raw = raw.filter(|s| !s.is_empty()).ok_or_else(|| anyhow!("missing public key"))?;
    raw.parse::<PublicKey>().context("invalid public key")
}
