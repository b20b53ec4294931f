use raffle_allocator::{
    allocator::Allocator,
    config::{EngineConfig, ReapplyPolicy},
    error::AllocError,
    ledger::Ledger,
    raffle_state::{NewRaffle, RaffleStatus},
    state::{Funding, RaffleId},
};
use solana_program::pubkey::Pubkey;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

fn raffle_params() -> NewRaffle {
    NewRaffle {
        title: "Weekend raffle".to_string(),
        description: "Motorbike giveaway".to_string(),
        prize_value: 5_000_000,
        operation_cost: 250_000,
        unit_ticket_price: 100,
        tickets_required: 0,
        min_tickets_per_application: 1,
        min_ticket_level: 0,
        max_tickets_per_user: 0,
        draw_date: 1_900_000_000,
        creator: Pubkey::new_unique(),
    }
}

// Ledger with a small pool and one active raffle
fn setup(pool_size: u32, params: NewRaffle) -> (Ledger, RaffleId) {
    setup_with(
        EngineConfig {
            pool_size,
            ..EngineConfig::default()
        },
        params,
    )
}

fn setup_with(config: EngineConfig, params: NewRaffle) -> (Ledger, RaffleId) {
    let ledger = Ledger::new(config);
    let raffle_id = ledger.create_raffle(params).unwrap();
    ledger
        .transition_raffle(raffle_id, RaffleStatus::Active)
        .unwrap();
    (ledger, raffle_id)
}

#[test]
fn test_apply_tickets_binds_distinct_numbers() {
    let (ledger, raffle_id) = setup(1_000, raffle_params());
    let user = Pubkey::new_unique();
    ledger.grant_ticket_credits(&user, 1, 5, 0).unwrap();

    let applied = Allocator::apply_tickets(&ledger, &user, raffle_id, Some(5)).unwrap();

    assert_eq!(applied.bindings.len(), 5);
    assert_eq!(applied.remaining_credits, 0);
    assert_eq!(applied.currency_charged, 0);
    let numbers: HashSet<u32> = applied.bindings.iter().map(|b| b.ticket_number).collect();
    assert_eq!(numbers.len(), 5);
    assert!(numbers.iter().all(|n| *n < 1_000));
    for binding in &applied.bindings {
        assert_eq!(binding.label.len(), 7);
        assert_eq!(binding.label.parse::<u32>().unwrap(), binding.ticket_number);
    }

    assert_eq!(ledger.raffle(raffle_id).unwrap().tickets_sold, 5);
    assert_eq!(ledger.ticket_credit_balance(&user).unwrap(), 0);
    let held = ledger.user_bindings(&user, raffle_id).unwrap();
    assert_eq!(held.len(), 5);
    assert!(held.iter().all(|b| b.is_held()));
}

#[test]
fn test_apply_defaults_to_raffle_minimum() {
    let (ledger, raffle_id) = setup(
        100,
        NewRaffle {
            min_tickets_per_application: 3,
            ..raffle_params()
        },
    );
    let user = Pubkey::new_unique();
    ledger.grant_ticket_credits(&user, 1, 10, 0).unwrap();

    let applied = Allocator::apply_tickets(&ledger, &user, raffle_id, None).unwrap();
    assert_eq!(applied.bindings.len(), 3);
    assert_eq!(applied.remaining_credits, 7);

    let result = Allocator::apply_tickets(&ledger, &user, raffle_id, Some(2));
    assert_eq!(
        result,
        Err(AllocError::BelowMinimumQuantity {
            requested: 2,
            minimum: 3
        })
    );
}

#[test]
fn test_unavailable_raffles_are_rejected() {
    let ledger = Ledger::new(EngineConfig {
        pool_size: 100,
        ..EngineConfig::default()
    });
    let user = Pubkey::new_unique();
    ledger.grant_ticket_credits(&user, 1, 10, 0).unwrap();

    let result = Allocator::apply_tickets(&ledger, &user, 42, Some(1));
    assert_eq!(
        result,
        Err(AllocError::RaffleNotAvailable {
            raffle_id: 42,
            status: None
        })
    );

    let draft = ledger.create_raffle(raffle_params()).unwrap();
    let result = Allocator::apply_tickets(&ledger, &user, draft, Some(1));
    assert_eq!(
        result,
        Err(AllocError::RaffleNotAvailable {
            raffle_id: draft,
            status: Some(RaffleStatus::Draft)
        })
    );
    assert_eq!(ledger.ticket_credit_balance(&user).unwrap(), 10);
}

#[test]
fn test_preconditions_are_checked_in_order() {
    let (ledger, raffle_id) = setup(
        100,
        NewRaffle {
            min_tickets_per_application: 2,
            max_tickets_per_user: 4,
            ..raffle_params()
        },
    );
    // No credits at all, so every rule before the credit check wins
    let user = Pubkey::new_unique();

    let result = Allocator::apply_tickets(&ledger, &user, raffle_id, Some(1));
    assert_eq!(
        result,
        Err(AllocError::BelowMinimumQuantity {
            requested: 1,
            minimum: 2
        })
    );

    let result = Allocator::apply_tickets(&ledger, &user, raffle_id, Some(5));
    assert_eq!(
        result,
        Err(AllocError::PerUserCapExceeded {
            requested: 5,
            held: 0,
            cap: 4,
            remaining: 4
        })
    );

    let result = Allocator::apply_tickets(&ledger, &user, raffle_id, Some(3));
    assert_eq!(
        result,
        Err(AllocError::InsufficientTicketCredits {
            held: 0,
            required: 3
        })
    );
}

#[test]
fn test_cap_counts_existing_holding() {
    let (ledger, raffle_id) = setup(
        100,
        NewRaffle {
            max_tickets_per_user: 5,
            ..raffle_params()
        },
    );
    let user = Pubkey::new_unique();
    ledger.grant_ticket_credits(&user, 1, 20, 0).unwrap();

    Allocator::apply_tickets(&ledger, &user, raffle_id, Some(3)).unwrap();
    let result = Allocator::apply_tickets(&ledger, &user, raffle_id, Some(3));
    assert_eq!(
        result,
        Err(AllocError::PerUserCapExceeded {
            requested: 3,
            held: 3,
            cap: 5,
            remaining: 2
        })
    );

    let applied = Allocator::apply_tickets(&ledger, &user, raffle_id, Some(2)).unwrap();
    assert_eq!(applied.bindings.len(), 2);
    assert_eq!(ledger.user_bindings(&user, raffle_id).unwrap().len(), 5);
}

#[test]
fn test_credit_level_filter() {
    let (ledger, raffle_id) = setup(
        100,
        NewRaffle {
            min_ticket_level: 2,
            ..raffle_params()
        },
    );
    let user = Pubkey::new_unique();
    let low = ledger.grant_ticket_credits(&user, 1, 5, 0).unwrap();
    let high = ledger.grant_ticket_credits(&user, 3, 2, 0).unwrap();

    let result = Allocator::apply_tickets(&ledger, &user, raffle_id, Some(3));
    assert_eq!(
        result,
        Err(AllocError::InsufficientTicketCredits {
            held: 2,
            required: 3
        })
    );

    let applied = Allocator::apply_tickets(&ledger, &user, raffle_id, Some(2)).unwrap();
    assert_eq!(applied.remaining_credits, 5);

    let batches = ledger.credit_batches(&user).unwrap();
    let low_batch = batches.iter().find(|b| b.id == low).unwrap();
    let high_batch = batches.iter().find(|b| b.id == high).unwrap();
    assert_eq!(low_batch.used, 0);
    assert_eq!(high_batch.used, 2);
}

#[test]
fn test_lowest_eligible_level_is_spent_first() {
    let (ledger, raffle_id) = setup(100, raffle_params());
    let user = Pubkey::new_unique();
    let premium = ledger.grant_ticket_credits(&user, 5, 10, 0).unwrap();
    let basic = ledger.grant_ticket_credits(&user, 2, 2, 0).unwrap();

    let applied = Allocator::apply_tickets(&ledger, &user, raffle_id, Some(4)).unwrap();
    assert_eq!(applied.remaining_credits, 8);

    let batches = ledger.credit_batches(&user).unwrap();
    assert_eq!(batches.iter().find(|b| b.id == basic).unwrap().used, 2);
    assert_eq!(batches.iter().find(|b| b.id == premium).unwrap().used, 2);

    let funders: Vec<Funding> = ledger
        .user_bindings(&user, raffle_id)
        .unwrap()
        .into_iter()
        .map(|b| b.funding)
        .collect();
    let from_basic = funders
        .iter()
        .filter(|f| **f == Funding::TicketCredits { batch_id: basic })
        .count();
    assert_eq!(from_basic, 2);
}

#[test]
fn test_bonus_credits_are_spent_after_normal_ones() {
    let (ledger, raffle_id) = setup(100, raffle_params());
    let user = Pubkey::new_unique();
    ledger.grant_ticket_credits(&user, 1, 2, 2).unwrap();

    Allocator::apply_tickets(&ledger, &user, raffle_id, Some(3)).unwrap();

    let batch = &ledger.credit_batches(&user).unwrap()[0];
    assert_eq!(batch.used, 3);
    assert_eq!(batch.normal_remaining(), 0);
    assert_eq!(batch.bonus_remaining(), 1);
}

#[test]
fn test_pool_exhausted_leaves_ledger_untouched() {
    let (ledger, raffle_id) = setup(5, raffle_params());
    let first = Pubkey::new_unique();
    let second = Pubkey::new_unique();
    ledger.grant_ticket_credits(&first, 1, 3, 0).unwrap();
    ledger.grant_ticket_credits(&second, 1, 3, 0).unwrap();

    Allocator::apply_tickets(&ledger, &first, raffle_id, Some(3)).unwrap();
    let before = ledger.snapshot().unwrap();

    let result = Allocator::apply_tickets(&ledger, &second, raffle_id, Some(3));
    assert_eq!(
        result,
        Err(AllocError::PoolExhausted {
            requested: 3,
            available: 2
        })
    );
    assert_eq!(ledger.snapshot().unwrap(), before);
    assert_eq!(ledger.ticket_credit_balance(&second).unwrap(), 3);
}

#[test]
fn test_capped_raffle_spends_every_eligible_credit() {
    let (ledger, raffle_id) = setup(
        1_000,
        NewRaffle {
            tickets_required: 100,
            min_ticket_level: 1,
            max_tickets_per_user: 10,
            ..raffle_params()
        },
    );
    let user = Pubkey::new_unique();
    ledger.grant_ticket_credits(&user, 1, 5, 0).unwrap();

    let applied = Allocator::apply_tickets(&ledger, &user, raffle_id, Some(5)).unwrap();
    assert_eq!(applied.bindings.len(), 5);
    assert_eq!(applied.remaining_credits, 0);
    let numbers: HashSet<u32> = applied.bindings.iter().map(|b| b.ticket_number).collect();
    assert_eq!(numbers.len(), 5);
    assert_eq!(ledger.raffle(raffle_id).unwrap().tickets_sold, 5);

    let result = Allocator::apply_tickets(&ledger, &user, raffle_id, Some(1));
    assert_eq!(
        result,
        Err(AllocError::InsufficientTicketCredits {
            held: 0,
            required: 1
        })
    );
    assert_eq!(ledger.user_bindings(&user, raffle_id).unwrap().len(), 5);
    assert_eq!(ledger.raffle(raffle_id).unwrap().tickets_sold, 5);
}

#[test]
fn test_dense_raffle_takes_every_remaining_number() {
    let (ledger, raffle_id) = setup(50, raffle_params());
    let user = Pubkey::new_unique();
    ledger.grant_ticket_credits(&user, 1, 50, 0).unwrap();

    let applied = Allocator::apply_tickets(&ledger, &user, raffle_id, Some(50)).unwrap();
    let numbers: HashSet<u32> = applied.bindings.iter().map(|b| b.ticket_number).collect();
    assert_eq!(numbers, (0..50).collect::<HashSet<u32>>());
}

#[test]
fn test_retired_numbers_are_never_drawn() {
    let (ledger, raffle_id) = setup(5, raffle_params());
    ledger.pool().retire(0, 0).unwrap();
    ledger.pool().retire(1, 0).unwrap();
    let user = Pubkey::new_unique();
    ledger.grant_ticket_credits(&user, 1, 5, 0).unwrap();

    let applied = Allocator::apply_tickets(&ledger, &user, raffle_id, Some(3)).unwrap();
    let numbers: HashSet<u32> = applied.bindings.iter().map(|b| b.ticket_number).collect();
    assert_eq!(numbers, [2, 3, 4].into_iter().collect::<HashSet<u32>>());

    let result = Allocator::apply_tickets(&ledger, &user, raffle_id, Some(1));
    assert_eq!(
        result,
        Err(AllocError::PoolExhausted {
            requested: 1,
            available: 0
        })
    );
}

#[test]
fn test_same_number_may_be_bound_in_different_raffles() {
    let (ledger, first_raffle) = setup(3, raffle_params());
    let second_raffle = ledger.create_raffle(raffle_params()).unwrap();
    ledger
        .transition_raffle(second_raffle, RaffleStatus::Active)
        .unwrap();
    let user = Pubkey::new_unique();
    ledger.grant_ticket_credits(&user, 1, 6, 0).unwrap();

    let a = Allocator::apply_tickets(&ledger, &user, first_raffle, Some(3)).unwrap();
    let b = Allocator::apply_tickets(&ledger, &user, second_raffle, Some(3)).unwrap();

    let a: HashSet<u32> = a.bindings.iter().map(|b| b.ticket_number).collect();
    let b: HashSet<u32> = b.bindings.iter().map(|b| b.ticket_number).collect();
    assert_eq!(a, b);
}

#[test]
fn test_single_application_policy() {
    let (ledger, raffle_id) = setup_with(
        EngineConfig {
            pool_size: 100,
            reapply_policy: ReapplyPolicy::SingleApplication,
            ..EngineConfig::default()
        },
        raffle_params(),
    );
    let user = Pubkey::new_unique();
    ledger.grant_ticket_credits(&user, 1, 10, 0).unwrap();

    Allocator::apply_tickets(&ledger, &user, raffle_id, Some(2)).unwrap();
    let result = Allocator::apply_tickets(&ledger, &user, raffle_id, Some(2));
    assert_eq!(
        result,
        Err(AllocError::AlreadyApplied {
            raffle_id,
            held: 2
        })
    );
    assert_eq!(ledger.ticket_credit_balance(&user).unwrap(), 8);
}

#[test]
fn test_top_up_policy_allows_reapplication() {
    let (ledger, raffle_id) = setup(100, raffle_params());
    let user = Pubkey::new_unique();
    ledger.grant_ticket_credits(&user, 1, 10, 0).unwrap();

    Allocator::apply_tickets(&ledger, &user, raffle_id, Some(2)).unwrap();
    Allocator::apply_tickets(&ledger, &user, raffle_id, Some(2)).unwrap();
    assert_eq!(ledger.user_bindings(&user, raffle_id).unwrap().len(), 4);
}

#[test]
fn test_sold_out_raffle() {
    let (ledger, raffle_id) = setup(
        100,
        NewRaffle {
            tickets_required: 4,
            ..raffle_params()
        },
    );
    let user = Pubkey::new_unique();
    ledger.grant_ticket_credits(&user, 1, 10, 0).unwrap();

    Allocator::apply_tickets(&ledger, &user, raffle_id, Some(3)).unwrap();
    let result = Allocator::apply_tickets(&ledger, &user, raffle_id, Some(2));
    assert_eq!(
        result,
        Err(AllocError::RaffleSoldOut {
            requested: 2,
            remaining: 1
        })
    );
    Allocator::apply_tickets(&ledger, &user, raffle_id, Some(1)).unwrap();
    assert_eq!(ledger.raffle(raffle_id).unwrap().tickets_sold, 4);
}

#[test]
fn test_concurrent_applications_respect_cap() {
    let (ledger, raffle_id) = setup(
        1_000,
        NewRaffle {
            max_tickets_per_user: 3,
            ..raffle_params()
        },
    );
    let ledger = Arc::new(ledger);
    let user = Pubkey::new_unique();
    ledger.grant_ticket_credits(&user, 1, 20, 0).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ledger = ledger.clone();
            thread::spawn(move || Allocator::apply_tickets(&ledger, &user, raffle_id, Some(1)))
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, AllocError::PerUserCapExceeded { remaining: 0, .. })));
    assert_eq!(ledger.user_bindings(&user, raffle_id).unwrap().len(), 3);
    assert_eq!(ledger.ticket_credit_balance(&user).unwrap(), 17);
}

#[test]
fn test_two_users_racing_for_the_last_number() {
    let (ledger, raffle_id) = setup(1, raffle_params());
    let ledger = Arc::new(ledger);
    let users = [Pubkey::new_unique(), Pubkey::new_unique()];
    for user in &users {
        ledger.grant_ticket_credits(user, 1, 1, 0).unwrap();
    }

    let handles: Vec<_> = users
        .iter()
        .map(|user| {
            let ledger = ledger.clone();
            let user = *user;
            thread::spawn(move || Allocator::apply_tickets(&ledger, &user, raffle_id, Some(1)))
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| *r
        == Err(AllocError::PoolExhausted {
            requested: 1,
            available: 0
        })));
    let remaining: u64 = users
        .iter()
        .map(|u| ledger.ticket_credit_balance(u).unwrap())
        .sum();
    assert_eq!(remaining, 1);
}

#[test]
fn test_concurrent_users_never_share_a_number() {
    let (ledger, raffle_id) = setup(100, raffle_params());
    let ledger = Arc::new(ledger);
    let users: Vec<Pubkey> = (0..10).map(|_| Pubkey::new_unique()).collect();
    for user in &users {
        ledger.grant_ticket_credits(user, 1, 10, 0).unwrap();
    }

    let handles: Vec<_> = users
        .iter()
        .map(|user| {
            let ledger = ledger.clone();
            let user = *user;
            thread::spawn(move || {
                (0..5)
                    .map(|_| Allocator::apply_tickets(&ledger, &user, raffle_id, Some(2)))
                    .collect::<Result<Vec<_>, _>>()
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let bindings = ledger.raffle_bindings(raffle_id).unwrap();
    let numbers: HashSet<u32> = bindings.iter().map(|b| b.ticket_number).collect();
    assert_eq!(bindings.len(), 100);
    assert_eq!(numbers, (0..100).collect::<HashSet<u32>>());
    assert_eq!(ledger.raffle(raffle_id).unwrap().tickets_sold, 100);
    for user in &users {
        assert_eq!(ledger.ticket_credit_balance(user).unwrap(), 0);
    }
}

#[test]
fn test_wallet_purchase_charges_unit_price() {
    let (ledger, raffle_id) = setup(100, raffle_params());
    let user = Pubkey::new_unique();
    ledger.deposit(&user, 1_000).unwrap();

    let applied =
        Allocator::apply_tickets_with_wallet(&ledger, &user, raffle_id, Some(3), None).unwrap();

    assert_eq!(applied.currency_charged, 300);
    assert_eq!(applied.remaining_balance, 700);
    assert_eq!(ledger.wallet(&user).unwrap().balance, 700);
    assert!(ledger
        .user_bindings(&user, raffle_id)
        .unwrap()
        .iter()
        .all(|b| b.funding == Funding::Currency { unit_price: 100 }));
}

#[test]
fn test_wallet_purchase_respects_blocked_funds() {
    let (ledger, raffle_id) = setup(100, raffle_params());
    let user = Pubkey::new_unique();
    ledger.deposit(&user, 500).unwrap();
    ledger.block_funds(&user, 300).unwrap();

    let result = Allocator::apply_tickets_with_wallet(&ledger, &user, raffle_id, Some(3), None);
    assert_eq!(
        result,
        Err(AllocError::InsufficientCurrencyBalance {
            available: 200,
            required: 300
        })
    );

    ledger.release_funds(&user, 300).unwrap();
    Allocator::apply_tickets_with_wallet(&ledger, &user, raffle_id, Some(3), None).unwrap();
    assert_eq!(ledger.wallet(&user).unwrap().balance, 200);
}

#[test]
fn test_wallet_purchase_needs_globally_unbound_numbers() {
    let (ledger, first_raffle) = setup(3, raffle_params());
    let second_raffle = ledger.create_raffle(raffle_params()).unwrap();
    ledger
        .transition_raffle(second_raffle, RaffleStatus::Active)
        .unwrap();
    let user = Pubkey::new_unique();
    ledger.grant_ticket_credits(&user, 1, 3, 0).unwrap();
    ledger.deposit(&user, 1_000).unwrap();

    Allocator::apply_tickets(&ledger, &user, first_raffle, Some(3)).unwrap();
    let result = Allocator::apply_tickets_with_wallet(&ledger, &user, second_raffle, Some(1), None);
    assert_eq!(
        result,
        Err(AllocError::PoolExhausted {
            requested: 1,
            available: 0
        })
    );
    assert_eq!(ledger.wallet(&user).unwrap().balance, 1_000);
}

#[test]
fn test_wallet_purchase_past_deadline_writes_nothing() {
    let (ledger, raffle_id) = setup(100, raffle_params());
    let user = Pubkey::new_unique();
    ledger.deposit(&user, 1_000).unwrap();
    let before = ledger.snapshot().unwrap();

    let result = Allocator::apply_tickets_with_wallet(
        &ledger,
        &user,
        raffle_id,
        Some(2),
        Some(Instant::now()),
    );
    assert_eq!(result, Err(AllocError::DeadlineExceeded));
    assert_eq!(ledger.snapshot().unwrap(), before);
}

#[test]
fn test_huge_credit_grants_do_not_overflow() {
    let (ledger, raffle_id) = setup(100, raffle_params());
    let user = Pubkey::new_unique();

    assert_eq!(
        ledger.grant_ticket_credits(&user, 1, u64::MAX, 1),
        Err(AllocError::ArithmeticOverflow)
    );
    assert!(ledger.credit_batches(&user).unwrap().is_empty());

    ledger.grant_ticket_credits(&user, 1, u64::MAX, 0).unwrap();
    ledger.grant_ticket_credits(&user, 2, u64::MAX - 1, 1).unwrap();
    assert_eq!(ledger.ticket_credit_balance(&user).unwrap(), u64::MAX);

    let applied = Allocator::apply_tickets(&ledger, &user, raffle_id, Some(2)).unwrap();
    assert_eq!(applied.bindings.len(), 2);
    assert_eq!(applied.remaining_credits, u64::MAX);
}
