//! Subscription matching
//!
//! Pure predicates deciding whether a `Listener` pattern selects a message.
//! Zero endpoint fields are wildcards, and a pattern site of `LOCAL_SITE`
//! also matches the gateway's real site id.

use crate::broker::message::{EndPoint, LOCAL_SITE, Listener, Message};

/// Match one concrete endpoint against an optional pattern.
pub fn matches_ep(pattern: Option<&EndPoint>, target: Option<&EndPoint>, local_site: u32) -> bool {
    let Some(p) = pattern else {
        return true;
    };
    let Some(t) = target else {
        return false;
    };

    if p.site != 0 && p.site != t.site && !(p.site == LOCAL_SITE && t.site == local_site) {
        return false;
    }
    if p.aid != 0 && p.aid != t.aid {
        return false;
    }
    if p.eid != 0 && p.eid != t.eid {
        return false;
    }
    if p.pid != 0 && p.pid != t.pid {
        return false;
    }
    true
}

/// Source must match, at least one destination must match when the pattern
/// names one, and a non-empty type must equal the body's type tag exactly.
pub fn matches(listener: &Listener, msg: &Message, local_site: u32) -> bool {
    if !matches_ep(listener.source.as_ref(), msg.source.as_ref(), local_site) {
        return false;
    }

    if listener.destination.is_some()
        && !msg
            .destination
            .iter()
            .any(|d| matches_ep(listener.destination.as_ref(), Some(d), local_site))
    {
        return false;
    }

    listener.message_type.is_empty() || listener.message_type == msg.message_type()
}
