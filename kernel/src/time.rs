//! Time management
//!
//! Contador de ticks monotônico usado pelos timestamps de IPC.

use core::sync::atomic::{AtomicU64, Ordering};

/// Ticks desde o boot (incrementado pelo timer IRQ)
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Chamado pelo timer IRQ handler
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Retorna ticks desde o boot
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_advance() {
        let before = ticks();
        tick();
        tick();
        assert!(ticks() >= before + 2);
    }
}
