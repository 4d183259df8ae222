//! Broadcast classification. Pure functions over a message and the config.

use crate::config::{BotConfig, clean_address};
use crate::email::InboundMessage;
use crate::events::Event;

/// Whether the router accepts `message` at all.
///
/// With `restrict_inbound` on, mail whose envelope recipient is not the
/// inbound address is dropped.
pub fn admits(message: &InboundMessage, config: &BotConfig) -> bool {
    !config.restrict_inbound || clean_address(&message.to) == clean_address(&config.inbound_address)
}

/// Exactly one of `DirectEmail`, `CcEmail` or `BccEmail`.
///
/// The bot counts as addressed when either its inbound address or the
/// message's envelope recipient appears in a list. Bcc is the fallback
/// since blind copies never show up in headers.
pub fn classify(message: &InboundMessage, config: &BotConfig) -> Event {
    let ours = [
        clean_address(&config.inbound_address),
        clean_address(&message.to),
    ];
    let listed = |list: &[String]| {
        list.iter()
            .map(|a| clean_address(a))
            .any(|a| !a.is_empty() && ours.contains(&a))
    };

    if listed(&message.recipients) {
        Event::DirectEmail
    } else if listed(&message.cc) {
        Event::CcEmail
    } else {
        Event::BccEmail
    }
}

/// Mention events for the latest body text: `DirectMention` when it contains
/// one of the bot's addresses, `Mention` when it contains the bot's name.
pub fn mentions(message: &InboundMessage, config: &BotConfig) -> Vec<Event> {
    let body = message.latest_text().to_lowercase();
    let mut events = Vec::new();

    let addressed = [&config.sending_address, &config.inbound_address]
        .into_iter()
        .map(|a| clean_address(a))
        .any(|a| !a.is_empty() && body.contains(&a));
    if addressed {
        events.push(Event::DirectMention);
    }

    let name = config.bot_name.trim().to_lowercase();
    if !name.is_empty() && contains_word(&body, &name) {
        events.push(Event::Mention);
    }
    events
}

/// `needle` appears in `haystack` with no alphanumeric character on either side.
fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}
