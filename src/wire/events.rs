//! The decoder's item type: either a successfully parsed command or a
//! recognized-but-rejected one. Faktory has no separate body transfer
//! (the JSON argument is always inline on the command line), so there's
//! no third "body chunk" variant to carry.

use crate::error::CommandError;
use crate::wire::protocol::Command;

#[derive(Debug)]
pub enum ClientEvent {
    /// A successfully parsed command.
    Command(Command),
    /// A recognized line that failed to parse (bad verb, bad JSON
    /// argument): the connection stays open and the caller sends the
    /// carried error as the response (spec §7 "Protocol parse" policy).
    Rejected(CommandError),
}
