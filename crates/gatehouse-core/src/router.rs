//! Symbol router (component C): deterministic partitioning of inbound
//! messages onto one or both matching shards.

use crate::types::InputMessage;

/// Which shard(s) an envelope should be delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Shard0,
    Shard1,
    Both,
}

/// `Flush` always routes to both shards (Open Question resolved: delivered
/// as two independent envelopes, one per shard). `Cancel` carries no symbol,
/// so which shard holds the order it targets cannot be determined from the
/// message alone; it is broadcast to both shards, and the engine that does
/// not own the referenced `user_order_id` treats it as a no-op (see E3 and
/// DESIGN.md). Everything else routes by the first byte of its symbol,
/// uppercase-normalized: `A..=M` to shard 0, `N..=Z` to shard 1; a missing,
/// null, or non-alphabetic first byte falls back to shard 0.
pub fn route(msg: &InputMessage) -> Route {
    match msg {
        InputMessage::Flush => Route::Both,
        InputMessage::Cancel { .. } => Route::Both,
        InputMessage::NewOrder { symbol, .. } => {
            let first = symbol.first_byte().to_ascii_uppercase();
            if (b'A'..=b'M').contains(&first) {
                Route::Shard0
            } else if (b'N'..=b'Z').contains(&first) {
                Route::Shard1
            } else {
                Route::Shard0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Side, Symbol};

    fn new_order(symbol: &str) -> InputMessage {
        InputMessage::NewOrder {
            user_id: 1,
            symbol: Symbol::from_str_padded(symbol),
            price: 1,
            quantity: 1,
            side: Side::Buy,
            user_order_id: 1,
        }
    }

    #[test]
    fn flush_routes_to_both() {
        assert_eq!(route(&InputMessage::Flush), Route::Both);
    }

    #[test]
    fn a_through_m_routes_shard0() {
        assert_eq!(route(&new_order("AAPL")), Route::Shard0);
        assert_eq!(route(&new_order("IBM")), Route::Shard0);
        assert_eq!(route(&new_order("MSFT")), Route::Shard0);
    }

    #[test]
    fn n_through_z_routes_shard1() {
        assert_eq!(route(&new_order("NVDA")), Route::Shard1);
        assert_eq!(route(&new_order("TSLA")), Route::Shard1);
        assert_eq!(route(&new_order("ZOOM")), Route::Shard1);
    }

    #[test]
    fn lowercase_symbol_still_routes_correctly() {
        assert_eq!(route(&new_order("aapl")), Route::Shard0);
        assert_eq!(route(&new_order("nvda")), Route::Shard1);
    }

    #[test]
    fn null_first_byte_falls_back_to_shard0() {
        assert_eq!(route(&new_order("")), Route::Shard0);
    }

    #[test]
    fn cancel_routes_to_both_shards() {
        assert_eq!(route(&InputMessage::Cancel { user_id: 1, user_order_id: 1 }), Route::Both);
    }

    proptest::proptest! {
        #[test]
        fn new_order_route_is_deterministic_for_any_byte(b in 0u8..=255) {
            let mut sym = [0u8; 8];
            sym[0] = b;
            let msg = InputMessage::NewOrder {
                user_id: 1,
                symbol: Symbol(sym),
                price: 1,
                quantity: 1,
                side: Side::Buy,
                user_order_id: 1,
            };
            let r1 = route(&msg);
            let r2 = route(&msg);
            proptest::prop_assert_eq!(r1, r2);
            proptest::prop_assert_ne!(r1, Route::Both);
        }
    }
}
