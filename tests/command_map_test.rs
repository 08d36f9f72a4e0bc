//! Command map built from the full declaration table.

use lecroy_daq::command::{CommandMap, CommandTemplate};
use lecroy_daq::pv::definitions::declarations;
use lecroy_daq::pv::{channel_of, SetterKind};

#[test]
fn test_channel_commands_address_their_channel() {
    let decls = declarations(12, "TCPIP::mock::INSTR");
    let map = CommandMap::build(&decls);

    for entry in map.entries() {
        assert!(!entry.command.contains('<'), "unresolved {}", entry.command);
        assert!(!entry.command.chars().any(char::is_lowercase));
        match channel_of(&entry.pv) {
            Some(channel) => assert!(
                entry.command.starts_with(&format!("C{}:", channel)),
                "{} -> {}",
                entry.pv,
                entry.command
            ),
            None => assert!(!entry.command.starts_with('C') || entry.command.starts_with("COMM")),
        }
    }
    assert_eq!(map.command("c12VoltOffset"), Some("C12:OFFSET"));
    assert_eq!(map.command("c07OnOff"), Some("C7:TRACE"));
}

#[test]
fn test_special_templates_are_not_queried() {
    let map = CommandMap::build(&declarations(1, "mock"));

    for pv in ["trigType", "trigSlope", "trigLevel", "samplingRate", "trigState"] {
        assert!(map.command(pv).is_none(), "{} should not be queried", pv);
        assert!(matches!(map.template(pv), Some(CommandTemplate::Special { .. })));
    }
    assert_eq!(map.setter("trigLevel"), Some(SetterKind::Scpi));
    assert_eq!(map.command("trigMode"), Some("TRIG_MODE"));
}

#[test]
fn test_entries_keep_declaration_order() {
    let decls = declarations(2, "mock");
    let map = CommandMap::build(&decls);

    let declared: Vec<&str> = decls
        .iter()
        .filter(|d| d.command.as_ref().is_some_and(CommandTemplate::is_queryable))
        .map(|d| d.name.as_str())
        .collect();
    let mapped: Vec<&str> = map.entries().iter().map(|e| e.pv.as_str()).collect();
    assert_eq!(declared, mapped);
    assert_eq!(map.len(), declared.len());
}

#[test]
fn test_malformed_templates_are_rejected() {
    assert!(CommandTemplate::parse("C<x>:VOLT_DIV").is_err());
    assert!(CommandTemplate::parse("!").is_err());
    assert!(CommandTemplate::parse("abc").is_err());
    assert!(CommandTemplate::parse("C<n>:VOLT_DIV").is_ok());
}
