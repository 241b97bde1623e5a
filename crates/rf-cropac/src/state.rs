//! Lock-free parameter snapshots
//!
//! Triple buffer between one writer (controller) and one reader (audio
//! thread). The writer publishes complete values, the reader always sees
//! the latest complete value and never blocks or allocates.

use std::cell::UnsafeCell;
use std::sync::Arc;

use portable_atomic::{AtomicU32, Ordering};

/// Bit set when the ready slot holds a value the reader has not taken yet
const FRESH: u32 = 0b100_0000;

/// Index state: bits 0-1 = write, bits 2-3 = ready, bits 4-5 = read, bit 6 = fresh
struct Shared<T> {
    buffers: [UnsafeCell<T>; 3],
    state: AtomicU32,
}

// The index state gives each slot a single owner at any time
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

/// Create a connected writer/reader pair holding `initial`
pub fn triple_buffer<T: Clone>(initial: T) -> (ParamWriter<T>, ParamReader<T>) {
    let shared = Arc::new(Shared {
        buffers: [
            UnsafeCell::new(initial.clone()),
            UnsafeCell::new(initial.clone()),
            UnsafeCell::new(initial),
        ],
        state: AtomicU32::new(0b00_01_10), // write=0, ready=1, read=2
    });
    (
        ParamWriter {
            shared: Arc::clone(&shared),
        },
        ParamReader { shared },
    )
}

/// Producer side
pub struct ParamWriter<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone> ParamWriter<T> {
    /// Copy `value` into the write slot and publish it
    ///
    /// `clone_from` reuses the slot's allocations where the type allows.
    pub fn publish(&mut self, value: &T) {
        let state = self.shared.state.load(Ordering::Acquire);
        let write_idx = (state & 0b11) as usize;
        // SAFETY: the write slot is owned by the (unique) writer
        unsafe { (*self.shared.buffers[write_idx].get()).clone_from(value) };

        loop {
            let state = self.shared.state.load(Ordering::Acquire);
            let write_idx = state & 0b11;
            let ready_idx = (state >> 2) & 0b11;
            let read_idx = (state >> 4) & 0b11;

            // Swap write and ready, mark fresh
            let new_state = ready_idx | (write_idx << 2) | (read_idx << 4) | FRESH;

            if self
                .shared
                .state
                .compare_exchange_weak(state, new_state, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }
}

/// Consumer side
pub struct ParamReader<T> {
    shared: Arc<Shared<T>>,
}

impl<T> ParamReader<T> {
    /// Latest published value
    ///
    /// The reference stays valid until the next call, which is how the
    /// processor holds one snapshot for a whole block.
    pub fn read(&mut self) -> &T {
        loop {
            let state = self.shared.state.load(Ordering::Acquire);
            if state & FRESH == 0 {
                break;
            }
            let write_idx = state & 0b11;
            let ready_idx = (state >> 2) & 0b11;
            let read_idx = (state >> 4) & 0b11;

            // Swap ready and read, clear fresh
            let new_state = write_idx | (read_idx << 2) | (ready_idx << 4);

            if self
                .shared
                .state
                .compare_exchange_weak(state, new_state, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let state = self.shared.state.load(Ordering::Acquire);
        let read_idx = ((state >> 4) & 0b11) as usize;
        // SAFETY: the read slot is owned by the (unique) reader
        unsafe { &*self.shared.buffers[read_idx].get() }
    }

    /// True when a newer value is waiting
    pub fn has_update(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) & FRESH != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_value() {
        let (_writer, mut reader) = triple_buffer(5u32);
        assert_eq!(*reader.read(), 5);
        assert!(!reader.has_update());
    }

    #[test]
    fn test_latest_value_wins() {
        let (mut writer, mut reader) = triple_buffer(0u32);
        writer.publish(&1);
        writer.publish(&2);
        writer.publish(&3);
        assert!(reader.has_update());
        assert_eq!(*reader.read(), 3);
    }

    #[test]
    fn test_repeated_reads_are_stable() {
        let (mut writer, mut reader) = triple_buffer(vec![0.0f32; 4]);
        writer.publish(&vec![1.0; 4]);
        assert_eq!(reader.read()[0], 1.0);
        // No new publication: the same value again, not an older slot
        assert_eq!(reader.read()[0], 1.0);
        assert_eq!(reader.read()[0], 1.0);
    }

    #[test]
    fn test_concurrent_publication() {
        let (mut writer, mut reader) = triple_buffer((0u64, 0u64));
        let handle = std::thread::spawn(move || {
            for i in 1..=10_000u64 {
                writer.publish(&(i, i * 2));
            }
        });

        let mut last = 0;
        while last < 10_000 {
            let (a, b) = *reader.read();
            assert_eq!(b, a * 2, "torn read");
            assert!(a >= last, "went backwards");
            last = a;
        }
        handle.join().unwrap();
    }
}
