//! Seeded end-to-end scenarios from the access-control invariants.

use std::sync::Arc;

use devclaw::access::{AccessManager, DefaultPolicy, Decision};
use devclaw::db::Store;
use devclaw::jid::normalize;
use devclaw::types::{AccessLevel, Channel};

fn access_manager(policy: DefaultPolicy, owner_raw: &str) -> AccessManager {
    let store = Arc::new(Store::open_in_memory().expect("open_in_memory should succeed"));
    let owner = normalize(Channel::WhatsApp, owner_raw).expect("owner jid should normalize");
    AccessManager::new(store, policy, owner)
}

#[test]
fn owner_override_grants_owner_level() {
    let mgr = access_manager(DefaultPolicy::Deny, "owner@s.whatsapp.net");
    let from = normalize(Channel::WhatsApp, "owner@s.whatsapp.net").expect("normalize should succeed");

    let decision = mgr.check(&from, None).expect("check should succeed");
    assert_eq!(decision, Decision::Allowed(AccessLevel::Owner));
    assert!(decision.is_allowed());
}

#[test]
fn brazil_eleven_to_ten_digit_collapse_is_recognized_as_owner() {
    // Owner configured with the legacy 11-digit + device-suffix form;
    // an inbound message normalized from the bare 13-digit form must
    // still match the same canonical jid.
    let mgr = access_manager(DefaultPolicy::Deny, "5511999999999:5@s.whatsapp.net");
    let from = normalize(Channel::WhatsApp, "5511999999999@s.whatsapp.net").expect("normalize should succeed");

    let decision = mgr.check(&from, None).expect("check should succeed");
    assert!(decision.is_allowed());
    assert_eq!(decision, Decision::Allowed(AccessLevel::Owner));
}

#[test]
fn ask_once_asks_exactly_once_per_identity() {
    let mgr = access_manager(DefaultPolicy::Ask, "owner@s.whatsapp.net");
    let stranger = normalize(Channel::WhatsApp, "447700900000@s.whatsapp.net").expect("normalize should succeed");

    let first = mgr.check(&stranger, None).expect("check should succeed");
    assert_eq!(first, Decision::AskPending);
    assert!(first.should_ask());
    assert!(!first.is_allowed());

    mgr.mark_asked(&stranger).expect("mark_asked should succeed");

    let second = mgr.check(&stranger, None).expect("check should succeed");
    assert_eq!(second, Decision::Denied);
    assert!(!second.should_ask());
    assert!(!second.is_allowed());
}

#[test]
fn blocked_user_overrides_allowed_group() {
    let mgr = access_manager(DefaultPolicy::Deny, "owner@s.whatsapp.net");
    let user = normalize(Channel::WhatsApp, "15551234567@s.whatsapp.net").expect("normalize should succeed");

    mgr.set_group_policy(Channel::WhatsApp, "group-1", true).expect("set_group_policy should succeed");
    mgr.block_user(&user).expect("block_user should succeed");

    let decision = mgr.check(&user, Some("group-1")).expect("check should succeed");
    assert_eq!(decision, Decision::Blocked);
    assert!(!decision.is_allowed());
}
