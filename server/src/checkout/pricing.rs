//! Cart validation and pricing.
//!
//! Everything here is pure: the orchestrator locks and reads the rows a cart
//! touches into a [`CheckoutSnapshot`], and [`evaluate`] either turns the cart
//! into an [`OrderPlan`] or returns every rule violation it found.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};

use super::cart::{CartItem, CheckoutRequest, MAX_VOUCHER_CODE_LEN};
use crate::models::{
    DiscountKind, IdentityDocumentType, NewOrder, NewOrderLine, Seat, TicketOffering, User,
    Voucher, VoucherScope,
};

pub const IDENTITY_GATE_MESSAGE: &str = "You must verify your email before making a purchase";

/// Rows read under lock for one checkout.
#[derive(Debug, Clone, Default)]
pub struct CheckoutSnapshot {
    pub offerings: HashMap<i64, TicketOffering>,
    pub seats: HashMap<i64, Seat>,
    /// (event id, type id) pairs that sell numbered seats.
    pub seated_ticket_types: HashSet<(i64, i64)>,
    /// (event id, document number) pairs claimed by live orders.
    pub used_documents: HashSet<(i64, String)>,
    /// Present only when the cart carries a voucher code.
    pub voucher: Option<VoucherState>,
}

#[derive(Debug, Clone)]
pub struct VoucherState {
    /// `None` when no voucher has the supplied code.
    pub voucher: Option<Voucher>,
    /// Earlier redemptions of this voucher by the buyer.
    pub user_redemptions: i64,
}

impl CheckoutSnapshot {
    pub fn new(
        offerings: Vec<TicketOffering>,
        seats: Vec<Seat>,
        seated_ticket_types: HashSet<(i64, i64)>,
        used_documents: HashSet<(i64, String)>,
        voucher: Option<VoucherState>,
    ) -> Self {
        Self {
            offerings: offerings
                .into_iter()
                .map(|offering| (offering.id, offering))
                .collect(),
            seats: seats.into_iter().map(|seat| (seat.id, seat)).collect(),
            seated_ticket_types,
            used_documents,
            voucher,
        }
    }
}

/// A validated, priced cart ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderPlan {
    pub lines: Vec<NewOrderLine>,
    /// Total quantity per offering, ascending by offering id.
    pub quantities: BTreeMap<i64, i32>,
    /// Seats to book, ascending.
    pub seat_ids: Vec<i64>,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub voucher_id: Option<i64>,
}

impl OrderPlan {
    pub fn to_new_order(&self, user_id: i64) -> NewOrder {
        NewOrder {
            user_id,
            total_amount: self.total,
            discount_amount: self.discount,
            lines: self.lines.clone(),
        }
    }
}

/// Checks that need no stored state: request shape, the identity gate and
/// duplicate seats. Each stage short-circuits.
pub fn precheck(user: &User, request: &CheckoutRequest) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    if request.tickets.is_empty() {
        errors.push("At least one ticket is required".to_string());
    }
    for item in &request.tickets {
        if item.quantity < 1 {
            errors.push(format!(
                "Quantity for ticket offering {} must be at least 1",
                item.ticket_id
            ));
        }
    }
    if let Some(code) = request.voucher_code() {
        if code.chars().count() > MAX_VOUCHER_CODE_LEN {
            errors.push(format!(
                "Voucher code may not be longer than {MAX_VOUCHER_CODE_LEN} characters"
            ));
        }
    }
    if !errors.is_empty() {
        return Err(errors);
    }

    if !user.email_verified {
        return Err(vec![IDENTITY_GATE_MESSAGE.to_string()]);
    }

    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    for seat_id in request.seat_ids() {
        if !seen.insert(seat_id) && !duplicates.contains(&seat_id) {
            duplicates.push(seat_id);
        }
    }
    if !duplicates.is_empty() {
        return Err(duplicates
            .into_iter()
            .map(|seat_id| format!("Seat {seat_id} is selected more than once"))
            .collect());
    }

    Ok(())
}

/// Validates the cart against the locked snapshot and prices it.
pub fn evaluate(
    user: &User,
    request: &CheckoutRequest,
    snapshot: &CheckoutSnapshot,
    now: DateTime<Utc>,
) -> Result<OrderPlan, Vec<String>> {
    precheck(user, request)?;

    let mut errors = Vec::new();
    let mut claimed_documents: HashSet<(i64, String)> = HashSet::new();

    for (offering_id, items) in group_by_offering(&request.tickets) {
        let Some(offering) = snapshot.offerings.get(&offering_id) else {
            errors.push(format!("Ticket offering {offering_id} does not exist"));
            continue;
        };

        let requested: i64 = items.iter().map(|item| i64::from(item.quantity)).sum();
        if requested > i64::from(offering.quota) {
            errors.push(format!(
                "Ticket offering {} has only {} available",
                offering.id, offering.quota
            ));
        }

        if offering.requires_identity_document {
            for item in &items {
                check_identity_document(
                    offering,
                    item,
                    snapshot,
                    &mut claimed_documents,
                    &mut errors,
                );
            }
        }

        let seated = snapshot
            .seated_ticket_types
            .contains(&offering.seating_key());
        for item in &items {
            check_seat(offering, seated, item, snapshot, &mut errors);
        }
    }

    let voucher = match (request.voucher_code(), snapshot.voucher.as_ref()) {
        (Some(_), Some(state)) => check_voucher(state, request, snapshot, now, &mut errors),
        (Some(_), None) => {
            errors.push("Invalid voucher code".to_string());
            None
        }
        (None, _) => None,
    };

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(price(request, snapshot, voucher))
}

fn group_by_offering(items: &[CartItem]) -> Vec<(i64, Vec<&CartItem>)> {
    let mut groups: Vec<(i64, Vec<&CartItem>)> = Vec::new();
    for item in items {
        match groups.iter_mut().find(|(id, _)| *id == item.ticket_id) {
            Some((_, group)) => group.push(item),
            None => groups.push((item.ticket_id, vec![item])),
        }
    }
    groups
}

fn check_identity_document(
    offering: &TicketOffering,
    item: &CartItem,
    snapshot: &CheckoutSnapshot,
    claimed: &mut HashSet<(i64, String)>,
    errors: &mut Vec<String>,
) {
    let number = item.document_number();
    if number.is_none() {
        errors.push(format!(
            "Identity document number required for {}",
            offering.name
        ));
    }

    let kind = item
        .identity_document_type
        .as_deref()
        .and_then(|kind| kind.parse::<IdentityDocumentType>().ok());
    if kind.is_none() {
        errors.push(format!(
            "Invalid identity document type for ticket offering {}. Valid types: {}",
            offering.id,
            IdentityDocumentType::valid_values()
        ));
    }

    if item.quantity > 1 {
        errors.push(format!(
            "Ticket offering {} requires an identity document and is limited to 1 per purchase",
            offering.id
        ));
    }

    if let Some(number) = number {
        let key = (offering.event_id, number.to_string());
        if snapshot.used_documents.contains(&key) {
            errors.push(format!(
                "Identity document number {number} has already been used for this event"
            ));
        }
        if !claimed.insert(key) {
            errors.push(format!(
                "Identity document number {number} is used more than once for this event"
            ));
        }
    }
}

fn check_seat(
    offering: &TicketOffering,
    seated: bool,
    item: &CartItem,
    snapshot: &CheckoutSnapshot,
    errors: &mut Vec<String>,
) {
    match (seated, item.seat_id) {
        (true, None) => errors.push(format!(
            "Seat number required for ticket offering {}",
            offering.id
        )),
        (true, Some(seat_id)) => {
            match snapshot.seats.get(&seat_id) {
                Some(seat)
                    if seat.event_id == offering.event_id
                        && seat.type_id == offering.type_id
                        && !seat.is_booked => {}
                Some(seat) => errors.push(format!("Seat {} is not available", seat.seat_number)),
                None => errors.push(format!("Seat {seat_id} is not available")),
            }
            if item.quantity != 1 {
                errors.push(format!(
                    "Ticket offering {} uses numbered seats and is limited to 1 per seat",
                    offering.id
                ));
            }
        }
        (false, Some(_)) => errors.push(format!(
            "Ticket offering {} does not use numbered seats",
            offering.id
        )),
        (false, None) => {}
    }
}

fn check_voucher<'a>(
    state: &'a VoucherState,
    request: &CheckoutRequest,
    snapshot: &CheckoutSnapshot,
    now: DateTime<Utc>,
    errors: &mut Vec<String>,
) -> Option<&'a Voucher> {
    let Some(voucher) = state.voucher.as_ref() else {
        errors.push("Invalid voucher code".to_string());
        return None;
    };

    let before = errors.len();
    if voucher.is_expired(now) {
        errors.push("Voucher has expired".to_string());
    }
    if voucher.is_exhausted() {
        errors.push("Voucher has been fully redeemed".to_string());
    }
    if state.user_redemptions >= i64::from(voucher.usage_limit) {
        errors.push("You have already used this voucher".to_string());
    }
    match voucher.scope {
        VoucherScope::General => {}
        VoucherScope::Specific => {
            let outside_event = request.tickets.iter().any(|item| {
                snapshot
                    .offerings
                    .get(&item.ticket_id)
                    .is_some_and(|offering| Some(offering.event_id) != voucher.event_id)
            });
            if outside_event || voucher.event_id.is_none() {
                errors.push("Voucher is not valid for selected events".to_string());
            }
        }
    }

    (errors.len() == before).then_some(voucher)
}

fn price(
    request: &CheckoutRequest,
    snapshot: &CheckoutSnapshot,
    voucher: Option<&Voucher>,
) -> OrderPlan {
    let mut lines = Vec::with_capacity(request.tickets.len());
    let mut quantities = BTreeMap::new();
    let mut seat_ids = Vec::new();
    let mut subtotal = Decimal::ZERO;

    for item in &request.tickets {
        let Some(offering) = snapshot.offerings.get(&item.ticket_id) else {
            continue;
        };
        subtotal += offering.price * Decimal::from(item.quantity);
        *quantities.entry(offering.id).or_insert(0) += item.quantity;

        // Document fields are kept only where the offering asks for them.
        let (document_number, document_type) = if offering.requires_identity_document {
            (
                item.document_number().map(str::to_string),
                item.identity_document_type
                    .as_deref()
                    .and_then(|kind| kind.parse().ok()),
            )
        } else {
            (None, None)
        };

        seat_ids.extend(item.seat_id);
        lines.push(NewOrderLine {
            ticket_offering_id: offering.id,
            quantity: item.quantity,
            unit_price: offering.price,
            identity_document_number: document_number,
            identity_document_type: document_type,
            seat_id: item.seat_id,
        });
    }
    seat_ids.sort_unstable();

    let discount = voucher
        .map(|voucher| compute_discount(subtotal, voucher.discount_kind, voucher.discount))
        .unwrap_or(Decimal::ZERO);

    OrderPlan {
        lines,
        quantities,
        seat_ids,
        subtotal,
        discount,
        total: subtotal - discount,
        voucher_id: voucher.map(|voucher| voucher.id),
    }
}

/// Discount for `subtotal`, never negative and never above the subtotal.
pub fn compute_discount(subtotal: Decimal, kind: DiscountKind, value: Decimal) -> Decimal {
    let discount = match kind {
        DiscountKind::Percentage => (subtotal * value / Decimal::ONE_HUNDRED)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero),
        DiscountKind::Fixed => value.min(subtotal),
    };
    discount.max(Decimal::ZERO).min(subtotal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    const EVENT: i64 = 1;
    const OTHER_EVENT: i64 = 2;
    const STANDING: i64 = 10;
    const SEATED: i64 = 11;

    fn user(verified: bool) -> User {
        let now = Utc::now();
        User {
            id: 42,
            name: "Dana".into(),
            email: "dana@example.com".into(),
            email_verified: verified,
            api_token: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn offering(id: i64, event_id: i64, type_id: i64, price: Decimal, quota: i32) -> TicketOffering {
        let now = Utc::now();
        TicketOffering {
            id,
            event_id,
            category_id: 1,
            type_id,
            name: format!("Offering {id}"),
            price,
            quota,
            sold_count: 0,
            requires_identity_document: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn seat(id: i64, type_id: i64, booked: bool) -> Seat {
        let now = Utc::now();
        Seat {
            id,
            event_id: EVENT,
            type_id,
            seat_number: format!("A{id}"),
            is_booked: booked,
            created_at: now,
            updated_at: now,
        }
    }

    fn voucher(kind: DiscountKind, discount: Decimal) -> Voucher {
        let now = Utc::now();
        Voucher {
            id: 7,
            code: "SAVE10".into(),
            scope: VoucherScope::General,
            event_id: None,
            discount,
            discount_kind: kind,
            valid_until: now + Duration::days(1),
            usage_limit: 5,
            used_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn snapshot(offerings: Vec<TicketOffering>) -> CheckoutSnapshot {
        CheckoutSnapshot::new(offerings, vec![], HashSet::new(), HashSet::new(), None)
    }

    fn with_voucher(mut snapshot: CheckoutSnapshot, voucher: Voucher, used: i64) -> CheckoutSnapshot {
        snapshot.voucher = Some(VoucherState {
            voucher: Some(voucher),
            user_redemptions: used,
        });
        snapshot
    }

    #[test]
    fn test_prices_cart_without_voucher() {
        let snapshot = snapshot(vec![
            offering(1, EVENT, STANDING, dec!(50.00), 10),
            offering(2, EVENT, STANDING, dec!(20.00), 10),
        ]);
        let request = CheckoutRequest::new(vec![
            CartItem::new(1, 2),
            CartItem::new(2, 1),
            CartItem::new(1, 1),
        ]);

        let plan = evaluate(&user(true), &request, &snapshot, Utc::now()).unwrap();

        assert_eq!(plan.subtotal, dec!(170.00));
        assert_eq!(plan.discount, Decimal::ZERO);
        assert_eq!(plan.total, dec!(170.00));
        assert_eq!(plan.quantities, BTreeMap::from([(1, 3), (2, 1)]));
        assert_eq!(plan.lines.len(), 3);
        assert_eq!(plan.voucher_id, None);
    }

    #[test]
    fn test_insufficient_quota_is_one_error() {
        let snapshot = snapshot(vec![offering(1, EVENT, STANDING, dec!(10), 1)]);
        let request = CheckoutRequest::new(vec![CartItem::new(1, 2)]);

        let errors = evaluate(&user(true), &request, &snapshot, Utc::now()).unwrap_err();

        assert_eq!(errors, vec!["Ticket offering 1 has only 1 available"]);
    }

    #[test]
    fn test_quota_is_checked_against_summed_quantities() {
        let snapshot = snapshot(vec![offering(1, EVENT, STANDING, dec!(10), 3)]);
        let request = CheckoutRequest::new(vec![CartItem::new(1, 2), CartItem::new(1, 2)]);

        let errors = evaluate(&user(true), &request, &snapshot, Utc::now()).unwrap_err();

        assert_eq!(errors, vec!["Ticket offering 1 has only 3 available"]);
    }

    #[test]
    fn test_identity_gate_short_circuits() {
        let mut gated = offering(1, EVENT, STANDING, dec!(10), 0);
        gated.requires_identity_document = true;
        let snapshot = snapshot(vec![gated]);
        let request = CheckoutRequest::new(vec![
            CartItem::new(1, 1).with_identity_document("X1", "passport")
        ]);

        let errors = evaluate(&user(false), &request, &snapshot, Utc::now()).unwrap_err();

        assert_eq!(errors, vec![IDENTITY_GATE_MESSAGE]);
    }

    #[test]
    fn test_duplicate_seat_rejected_before_inventory() {
        let request = CheckoutRequest::new(vec![
            CartItem::new(1, 1).with_seat(5),
            CartItem::new(2, 1).with_seat(5),
            CartItem::new(999, 1),
        ]);

        let errors = precheck(&user(true), &request).unwrap_err();

        assert_eq!(errors, vec!["Seat 5 is selected more than once"]);
    }

    #[test]
    fn test_collects_all_errors() {
        let mut gated = offering(1, EVENT, STANDING, dec!(10), 5);
        gated.requires_identity_document = true;
        let snapshot = snapshot(vec![gated, offering(2, EVENT, STANDING, dec!(10), 0)]);
        let request = CheckoutRequest::new(vec![
            CartItem::new(1, 2),
            CartItem::new(2, 1),
            CartItem::new(3, 1),
        ]);

        let errors = evaluate(&user(true), &request, &snapshot, Utc::now()).unwrap_err();

        assert_eq!(
            errors,
            vec![
                "Identity document number required for Offering 1".to_string(),
                format!(
                    "Invalid identity document type for ticket offering 1. Valid types: {}",
                    IdentityDocumentType::valid_values()
                ),
                "Ticket offering 1 requires an identity document and is limited to 1 per purchase"
                    .to_string(),
                "Ticket offering 2 has only 0 available".to_string(),
                "Ticket offering 3 does not exist".to_string(),
            ]
        );
    }

    #[test]
    fn test_identity_document_reuse() {
        let mut gated = offering(1, EVENT, STANDING, dec!(10), 5);
        gated.requires_identity_document = true;
        let mut snapshot = snapshot(vec![gated]);
        snapshot.used_documents.insert((EVENT, "OLD".to_string()));
        let request = CheckoutRequest::new(vec![
            CartItem::new(1, 1).with_identity_document("X1", "passport"),
            CartItem::new(1, 1).with_identity_document("X1", "national"),
            CartItem::new(1, 1).with_identity_document("OLD", "driving_license"),
        ]);

        let errors = evaluate(&user(true), &request, &snapshot, Utc::now()).unwrap_err();

        assert_eq!(
            errors,
            vec![
                "Identity document number X1 is used more than once for this event",
                "Identity document number OLD has already been used for this event",
            ]
        );
    }

    #[test]
    fn test_identity_document_is_one_per_event_across_offerings() {
        let mut front = offering(1, EVENT, STANDING, dec!(10), 5);
        front.requires_identity_document = true;
        let mut back = offering(2, EVENT, STANDING, dec!(8), 5);
        back.requires_identity_document = true;
        let mut elsewhere = offering(3, OTHER_EVENT, STANDING, dec!(8), 5);
        elsewhere.requires_identity_document = true;
        let snapshot = snapshot(vec![front, back, elsewhere]);

        let same_event = CheckoutRequest::new(vec![
            CartItem::new(1, 1).with_identity_document("X1", "passport"),
            CartItem::new(2, 1).with_identity_document("X1", "passport"),
        ]);
        let errors = evaluate(&user(true), &same_event, &snapshot, Utc::now()).unwrap_err();
        assert_eq!(
            errors,
            vec!["Identity document number X1 is used more than once for this event"]
        );

        let two_events = CheckoutRequest::new(vec![
            CartItem::new(1, 1).with_identity_document("X1", "passport"),
            CartItem::new(3, 1).with_identity_document("X1", "passport"),
        ]);
        assert!(evaluate(&user(true), &two_events, &snapshot, Utc::now()).is_ok());
    }

    #[test]
    fn test_identity_document_kept_on_line() {
        let mut gated = offering(1, EVENT, STANDING, dec!(10), 5);
        gated.requires_identity_document = true;
        let snapshot = snapshot(vec![gated]);
        let request = CheckoutRequest::new(vec![
            CartItem::new(1, 1).with_identity_document(" P-77 ", "passport")
        ]);

        let plan = evaluate(&user(true), &request, &snapshot, Utc::now()).unwrap();

        assert_eq!(
            plan.lines[0].identity_document_number.as_deref(),
            Some("P-77")
        );
        assert_eq!(
            plan.lines[0].identity_document_type,
            Some(IdentityDocumentType::Passport)
        );
    }

    #[test]
    fn test_seat_rules() {
        let mut snapshot = snapshot(vec![
            offering(1, EVENT, SEATED, dec!(30), 10),
            offering(2, EVENT, STANDING, dec!(10), 10),
        ]);
        snapshot.seated_ticket_types.insert((EVENT, SEATED));
        snapshot.seats.insert(5, seat(5, SEATED, false));
        snapshot.seats.insert(6, seat(6, SEATED, true));
        snapshot.seats.insert(7, seat(7, STANDING, false));
        let request = CheckoutRequest::new(vec![
            CartItem::new(1, 1),
            CartItem::new(1, 1).with_seat(6),
            CartItem::new(1, 1).with_seat(7),
            CartItem::new(1, 2).with_seat(5),
            CartItem::new(2, 1).with_seat(8),
        ]);

        let errors = evaluate(&user(true), &request, &snapshot, Utc::now()).unwrap_err();

        assert_eq!(
            errors,
            vec![
                "Seat number required for ticket offering 1",
                "Seat A6 is not available",
                "Seat A7 is not available",
                "Ticket offering 1 uses numbered seats and is limited to 1 per seat",
                "Ticket offering 2 does not use numbered seats",
            ]
        );
    }

    #[test]
    fn test_seat_plan_books_seats_in_order() {
        let mut snapshot = snapshot(vec![offering(1, EVENT, SEATED, dec!(30), 10)]);
        snapshot.seated_ticket_types.insert((EVENT, SEATED));
        snapshot.seats.insert(5, seat(5, SEATED, false));
        snapshot.seats.insert(3, seat(3, SEATED, false));
        let request = CheckoutRequest::new(vec![
            CartItem::new(1, 1).with_seat(5),
            CartItem::new(1, 1).with_seat(3),
        ]);

        let plan = evaluate(&user(true), &request, &snapshot, Utc::now()).unwrap();

        assert_eq!(plan.seat_ids, vec![3, 5]);
        assert_eq!(plan.total, dec!(60));
    }

    #[test]
    fn test_percentage_voucher() {
        let snapshot = with_voucher(
            snapshot(vec![offering(1, EVENT, STANDING, dec!(100), 10)]),
            voucher(DiscountKind::Percentage, dec!(10)),
            0,
        );
        let request = CheckoutRequest::new(vec![CartItem::new(1, 2)]).with_voucher("SAVE10");

        let plan = evaluate(&user(true), &request, &snapshot, Utc::now()).unwrap();

        assert_eq!(plan.subtotal, dec!(200));
        assert_eq!(plan.discount, dec!(20));
        assert_eq!(plan.total, dec!(180));
        assert_eq!(plan.voucher_id, Some(7));
    }

    #[test]
    fn test_fixed_discount_never_exceeds_subtotal() {
        assert_eq!(
            compute_discount(dec!(30), DiscountKind::Fixed, dec!(50)),
            dec!(30)
        );
        assert_eq!(
            compute_discount(dec!(30), DiscountKind::Fixed, dec!(5.50)),
            dec!(5.50)
        );
        assert_eq!(
            compute_discount(dec!(30), DiscountKind::Percentage, dec!(150)),
            dec!(30)
        );
        assert_eq!(
            compute_discount(dec!(33.33), DiscountKind::Percentage, dec!(15)),
            dec!(5.00)
        );
    }

    #[test]
    fn test_percentage_discount_rounds_half_away_from_zero() {
        assert_eq!(
            compute_discount(dec!(0.25), DiscountKind::Percentage, dec!(10)),
            dec!(0.03)
        );
        assert_eq!(
            compute_discount(dec!(0.65), DiscountKind::Percentage, dec!(10)),
            dec!(0.07)
        );
    }

    #[test]
    fn test_voucher_checks_are_independent() {
        let mut expired = voucher(DiscountKind::Fixed, dec!(5));
        expired.valid_until = Utc::now() - Duration::hours(1);
        expired.used_count = expired.usage_limit;
        let snapshot = with_voucher(
            snapshot(vec![offering(1, EVENT, STANDING, dec!(100), 10)]),
            expired,
            5,
        );
        let request = CheckoutRequest::new(vec![CartItem::new(1, 1)]).with_voucher("SAVE10");

        let errors = evaluate(&user(true), &request, &snapshot, Utc::now()).unwrap_err();

        assert_eq!(
            errors,
            vec![
                "Voucher has expired",
                "Voucher has been fully redeemed",
                "You have already used this voucher",
            ]
        );
    }

    #[test]
    fn test_unknown_voucher_code() {
        let mut snapshot = snapshot(vec![offering(1, EVENT, STANDING, dec!(100), 10)]);
        snapshot.voucher = Some(VoucherState {
            voucher: None,
            user_redemptions: 0,
        });
        let request = CheckoutRequest::new(vec![CartItem::new(1, 1)]).with_voucher("NOPE");

        let errors = evaluate(&user(true), &request, &snapshot, Utc::now()).unwrap_err();

        assert_eq!(errors, vec!["Invalid voucher code"]);
    }

    #[test]
    fn test_specific_voucher_rejects_mixed_events() {
        let mut specific = voucher(DiscountKind::Percentage, dec!(10));
        specific.scope = VoucherScope::Specific;
        specific.event_id = Some(EVENT);
        let snapshot = with_voucher(
            snapshot(vec![
                offering(1, EVENT, STANDING, dec!(100), 10),
                offering(2, OTHER_EVENT, STANDING, dec!(100), 10),
            ]),
            specific,
            0,
        );

        let mixed = CheckoutRequest::new(vec![CartItem::new(1, 1), CartItem::new(2, 1)])
            .with_voucher("SAVE10");
        let errors = evaluate(&user(true), &mixed, &snapshot, Utc::now()).unwrap_err();
        assert_eq!(errors, vec!["Voucher is not valid for selected events"]);

        let matching = CheckoutRequest::new(vec![CartItem::new(1, 1)]).with_voucher("SAVE10");
        let plan = evaluate(&user(true), &matching, &snapshot, Utc::now()).unwrap();
        assert_eq!(plan.total, dec!(90));
    }

    #[test]
    fn test_request_shape() {
        let errors = precheck(&user(false), &CheckoutRequest::new(vec![])).unwrap_err();
        assert_eq!(errors, vec!["At least one ticket is required"]);

        let errors = precheck(&user(true), &CheckoutRequest::new(vec![CartItem::new(1, 0)]))
            .unwrap_err();
        assert_eq!(errors, vec!["Quantity for ticket offering 1 must be at least 1"]);

        let long_code = "X".repeat(MAX_VOUCHER_CODE_LEN + 1);
        let request = CheckoutRequest::new(vec![CartItem::new(1, 1)]).with_voucher(&long_code);
        assert!(precheck(&user(true), &request).is_err());
    }
}
