//! The matching engine collaborator. The real matching logic is out of
//! scope for this crate (§1); [`MatchingEngine`] is the seam the processor
//! (component E) calls into, and [`StubEngine`] is a deterministic
//! price-time book sufficient to drive integration tests and `gatehouse
//! bench` without a real external engine.

use std::collections::HashMap;

use crate::types::{InputMessage, OutputMessage, Side, Symbol};

/// `process(&mut self, msg) -> outputs`, called serially by one processor
/// thread per shard — implementations do not need to be `Sync`, only `Send`
/// (each shard owns exactly one engine instance).
pub trait MatchingEngine: Send {
    fn process(&mut self, msg: &InputMessage) -> Vec<OutputMessage>;
}

#[derive(Clone, Copy, Debug)]
struct BookOrder {
    user_id: u32,
    user_order_id: u32,
    price: u32,
    quantity: u32,
}

#[derive(Default)]
struct Book {
    bids: Vec<BookOrder>,
    asks: Vec<BookOrder>,
}

impl Book {
    fn top(&self, side: Side) -> Option<(u32, u32)> {
        let levels = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        levels.first().map(|o| (o.price, o.quantity))
    }
}

/// A simple in-memory price-time order book, one per symbol, sufficient to
/// exercise the E1-E3 end-to-end scenarios. Not production matching logic —
/// it has no risk checks, no partial-fill priority refinements beyond
/// strict price-time, and holds its whole state in memory with no
/// persistence.
#[derive(Default)]
pub struct StubEngine {
    books: HashMap<Symbol, Book>,
}

impl StubEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn top_of_book_updates(symbol: Symbol, book: &Book, out: &mut Vec<OutputMessage>) {
        for side in [Side::Buy, Side::Sell] {
            match book.top(side) {
                Some((price, qty)) => out.push(OutputMessage::TopOfBook { symbol, side, price, quantity: qty }),
                None => out.push(OutputMessage::eliminated(symbol, side)),
            }
        }
    }
}

impl MatchingEngine for StubEngine {
    fn process(&mut self, msg: &InputMessage) -> Vec<OutputMessage> {
        let mut out = Vec::new();
        match *msg {
            InputMessage::NewOrder { user_id, symbol, price, quantity, side, user_order_id } => {
                out.push(OutputMessage::Ack { symbol, user_id, user_order_id });
                let book = self.books.entry(symbol).or_default();
                let mut remaining = quantity;

                let (resting, incoming_crosses): (&mut Vec<BookOrder>, fn(u32, u32) -> bool) = match side {
                    Side::Buy => (&mut book.asks, |incoming, resting| incoming >= resting),
                    Side::Sell => (&mut book.bids, |incoming, resting| incoming <= resting),
                };

                while remaining > 0 {
                    let Some(best) = resting.first().copied() else { break };
                    if !incoming_crosses(price, best.price) {
                        break;
                    }
                    let traded = remaining.min(best.quantity);
                    let (buy_user, buy_order, sell_user, sell_order) = match side {
                        Side::Buy => (user_id, user_order_id, best.user_id, best.user_order_id),
                        Side::Sell => (best.user_id, best.user_order_id, user_id, user_order_id),
                    };
                    out.push(OutputMessage::Trade {
                        symbol,
                        buy_user,
                        buy_order,
                        sell_user,
                        sell_order,
                        price: best.price,
                        quantity: traded,
                    });
                    remaining -= traded;
                    if traded == resting[0].quantity {
                        resting.remove(0);
                    } else {
                        resting[0].quantity -= traded;
                    }
                }

                if remaining > 0 {
                    let book = self.books.entry(symbol).or_default();
                    let level = match side {
                        Side::Buy => &mut book.bids,
                        Side::Sell => &mut book.asks,
                    };
                    level.push(BookOrder { user_id, user_order_id, price, quantity: remaining });
                    match side {
                        Side::Buy => level.sort_by_key(|b| std::cmp::Reverse(b.price)),
                        Side::Sell => level.sort_by_key(|a| a.price),
                    }
                }

                let book = &self.books[&symbol];
                Self::top_of_book_updates(symbol, book, &mut out);
            }
            InputMessage::Cancel { user_id, user_order_id } => {
                for (symbol, book) in self.books.iter_mut() {
                    let before_bids = book.bids.len();
                    let before_asks = book.asks.len();
                    book.bids.retain(|o| !(o.user_id == user_id && o.user_order_id == user_order_id));
                    book.asks.retain(|o| !(o.user_id == user_id && o.user_order_id == user_order_id));
                    if book.bids.len() != before_bids || book.asks.len() != before_asks {
                        out.push(OutputMessage::CancelAck { symbol: *symbol, user_id, user_order_id });
                        Self::top_of_book_updates(*symbol, book, &mut out);
                        break;
                    }
                }
            }
            InputMessage::Flush => {
                self.books.clear();
            }
        }
        out
    }
}
