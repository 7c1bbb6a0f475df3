//! Command Registry
//!
//! Process-wide mapping of command ids to their traits. The registry is
//! filled once at program start, before the first socket is started, and is
//! only read afterwards. Registering the same id with different traits is a
//! configuration bug surfaced by [`check_unique`].

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::error;
use uuid::Uuid;

/// Traits a command id is registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTraits {
    pub name: &'static str,
    /// Whether several handlers may process the command. A handler of a
    /// multi-handler command must not mark the message as processed.
    pub multi_handler: bool,
}

struct Registry {
    map: RwLock<HashMap<Uuid, Vec<CommandTraits>>>,
}

static REGISTRY: Lazy<Registry> = Lazy::new(|| Registry { map: RwLock::new(HashMap::new()) });

static BUILTIN: Lazy<()> = Lazy::new(crate::commands::register_builtin_commands);

fn registry() -> &'static Registry {
    Lazy::force(&BUILTIN);
    &REGISTRY
}

/// Registers a command id. Must be called before the first socket starts;
/// the registry is read concurrently without further synchronization cost
/// afterwards.
pub fn register(command: Uuid, name: &'static str, multi_handler: bool) {
    let traits = CommandTraits { name, multi_handler };
    let mut map = REGISTRY.map.write();
    let entry = map.entry(command).or_default();
    if !entry.contains(&traits) {
        entry.push(traits);
    }
}

/// Returns the registered name of a command.
pub fn command_name(command: &Uuid) -> Option<&'static str> {
    registry().map.read().get(command).and_then(|traits| traits.first()).map(|t| t.name)
}

/// Returns 0 when the command is not registered, 1 when it is registered as
/// single-handler and 2 when it is registered as multi-handler.
pub fn command_exists(command: &Uuid) -> u32 {
    match registry().map.read().get(command).and_then(|traits| traits.first()) {
        None => 0,
        Some(traits) if traits.multi_handler => 2,
        Some(_) => 1,
    }
}

pub fn command_is_single_handler(command: &Uuid) -> bool {
    command_exists(command) == 1
}

pub fn command_is_multi_handler(command: &Uuid) -> bool {
    command_exists(command) == 2
}

/// All registered command ids.
pub fn commands() -> Vec<Uuid> {
    registry().map.read().keys().copied().collect()
}

/// Verifies that no command id is registered with two distinct trait tuples.
/// Duplicates are logged.
pub fn check_unique() -> bool {
    let map = registry().map.read();
    let mut unique = true;
    for (command, traits) in map.iter() {
        if traits.len() > 1 {
            let names: Vec<&str> = traits.iter().map(|t| t.name).collect();
            error!(
                "Commands {} registered with identical identifier {command}",
                names.join(", ")
            );
            unique = false;
        }
    }
    unique
}

/// Log label for a command: its registered name when known, the bare id
/// otherwise.
pub(crate) fn command_label(command: &Uuid) -> String {
    match command_name(command) {
        Some(name) => format!("{name} ({command})"),
        None => command.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::command;

    #[test]
    fn test_builtin_commands_registered() {
        assert_eq!(command_exists(&command::PROTOCOL_COMPATIBLE), 2);
        assert_eq!(command_exists(&command::CLOSE_CONNECTION), 2);
        assert_eq!(command_name(&command::ECHO_CONNECTION), Some("EchoConnection"));
        assert!(command_is_multi_handler(&command::UNKNOWN));
    }

    #[test]
    fn test_unregistered_command() {
        let id = Uuid::from_u128(0x01010101_0101_0101_0101_010101010101);
        assert_eq!(command_exists(&id), 0);
        assert_eq!(command_name(&id), None);
    }

    #[test]
    fn test_register_and_uniqueness() {
        let id = Uuid::from_u128(0x02020202_0202_0202_0202_020202020202);
        register(id, "TestCommand", false);
        assert_eq!(command_exists(&id), 1);
        assert!(command_is_single_handler(&id));

        // Same traits again is idempotent
        register(id, "TestCommand", false);
        assert!(check_unique());

        // A different trait tuple under the same id breaks uniqueness
        let clash = Uuid::from_u128(0x03030303_0303_0303_0303_030303030303);
        register(clash, "First", false);
        register(clash, "Second", false);
        assert!(!check_unique());
    }

    #[test]
    fn test_command_label() {
        assert!(command_label(&command::ERROR).starts_with("Error ("));
        let id = Uuid::from_u128(0x04040404_0404_0404_0404_040404040404);
        assert_eq!(command_label(&id), id.to_string());
    }
}
