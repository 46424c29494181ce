//! Auto-approve pairing-token redemption, end to end.

use std::sync::Arc;

use devclaw::access::{AccessManager, DefaultPolicy};
use devclaw::db::Store;
use devclaw::pairing::{PairingManager, RedemptionOutcome};
use devclaw::types::{AccessLevel, Channel, PairingRole, SessionKey};

fn harness() -> (Arc<AccessManager>, PairingManager) {
    let store = Arc::new(Store::open_in_memory().expect("open_in_memory should succeed"));
    let owner = SessionKey::new(Channel::WhatsApp, "owner");
    let access = Arc::new(AccessManager::new(store.clone(), DefaultPolicy::Deny, owner));
    let pairing = PairingManager::new(store, access.clone(), 3600);
    (access, pairing)
}

#[test]
fn auto_approve_token_grants_access_immediately() {
    let (access, pairing) = harness();

    let token = pairing
        .mint_token(Channel::WhatsApp, PairingRole::User, 1, true, None, None, None)
        .expect("mint_token should succeed");

    let redeemer = SessionKey::new(Channel::WhatsApp, "foo");
    let outcome = pairing
        .redeem_token(&token.token, &redeemer, Some("Foo".to_owned()))
        .expect("redeem_token should succeed");

    assert_eq!(outcome, RedemptionOutcome::Granted(AccessLevel::User));

    let decision = access.check(&redeemer, None).expect("check should succeed");
    assert!(decision.is_allowed());
    assert_eq!(decision, devclaw::access::Decision::Allowed(AccessLevel::User));
}

#[test]
fn single_use_token_is_exhausted_after_one_redemption() {
    let (_access, pairing) = harness();

    let token = pairing
        .mint_token(Channel::WhatsApp, PairingRole::User, 1, true, None, None, None)
        .expect("mint_token should succeed");

    let first = SessionKey::new(Channel::WhatsApp, "first");
    pairing
        .redeem_token(&token.token, &first, None)
        .expect("first redemption should succeed");

    let second = SessionKey::new(Channel::WhatsApp, "second");
    let err = pairing
        .redeem_token(&token.token, &second, None)
        .expect_err("second redemption should fail, token is exhausted");
    assert!(matches!(err, devclaw::pairing::PairingError::TokenInvalid));
}

#[test]
fn manual_approval_token_files_a_pending_request_instead_of_granting() {
    let (access, pairing) = harness();

    let token = pairing
        .mint_token(Channel::WhatsApp, PairingRole::User, 5, false, None, None, None)
        .expect("mint_token should succeed");

    let requester = SessionKey::new(Channel::WhatsApp, "bar");
    let outcome = pairing
        .redeem_token(&token.token, &requester, Some("Bar".to_owned()))
        .expect("redeem_token should succeed");

    let request_id = match outcome {
        RedemptionOutcome::PendingApproval(id) => id,
        other => panic!("expected PendingApproval, got {other:?}"),
    };

    let decision = access.check(&requester, None).expect("check should succeed");
    assert!(!decision.is_allowed());

    let approved = pairing.approve(request_id, AccessLevel::User).expect("approve should succeed");
    assert_eq!(approved, requester);

    let decision = access.check(&requester, None).expect("check should succeed");
    assert!(decision.is_allowed());
}
