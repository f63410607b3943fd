//! Tick source: PIT channel 0
//!
//! Programs the programmable interval timer for a periodic heartbeat and
//! fans the tick out to the single registered callback (the scheduler
//! installs itself here).

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use super::interrupts::{self, InterruptContext};

/// PIT input clock in Hz.
const PIT_FREQUENCY: u32 = 1_193_182;

/// Default tick rate when the scheduler does not configure one.
pub const DEFAULT_HZ: u32 = 100;

static TICKS: AtomicU64 = AtomicU64::new(0);
static TICK_HZ: AtomicU32 = AtomicU32::new(DEFAULT_HZ);

/// Receives the current tick count on every timer interrupt.
pub type TickCallback = fn(u64);

static TICK_CALLBACK: Mutex<Option<TickCallback>> = Mutex::new(None);

/// Program the PIT for a periodic interrupt at `hz` and route IRQ 0 into
/// the tick handler.
pub fn init(hz: u32) {
    TICK_HZ.store(hz, Ordering::Relaxed);
    interrupts::register_handler(interrupts::TIMER_VECTOR, timer_interrupt);

    #[cfg(target_os = "none")]
    {
        let divisor = PIT_FREQUENCY / hz;
        // SAFETY: ports 0x43/0x40 are the PIT command and channel 0 data
        // ports; writing mode 0x36 (channel 0, lobyte/hibyte, rate
        // generator) followed by the 16-bit divisor is the documented
        // programming sequence.
        unsafe {
            use x86_64::instructions::port::Port;

            let mut cmd: Port<u8> = Port::new(0x43);
            let mut data: Port<u8> = Port::new(0x40);
            cmd.write(0x36u8);
            data.write((divisor & 0xFF) as u8);
            data.write((divisor >> 8) as u8);
        }
    }

    log::info!("PIT programmed for {} Hz tick", hz);
}

/// Install the tick callback. A single slot: the last registration wins.
pub fn register_tick_callback(callback: TickCallback) {
    *TICK_CALLBACK.lock() = Some(callback);
}

fn timer_interrupt(_ctx: &InterruptContext) {
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    let callback = *TICK_CALLBACK.lock();
    if let Some(callback) = callback {
        callback(now);
    }
}

/// Ticks elapsed since the PIT started firing.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Configured tick rate in Hz.
pub fn tick_hz() -> u32 {
    TICK_HZ.load(Ordering::Relaxed)
}

/// Milliseconds since boot, derived from the tick count. There is no
/// real-time clock; this is the kernel's only timestamp source.
pub fn uptime_ms() -> u64 {
    let hz = tick_hz() as u64;
    if hz == 0 {
        return 0;
    }
    ticks() * 1000 / hz
}

/// Block until at least `ms` milliseconds of ticks have elapsed, halting
/// the CPU between interrupts.
pub fn sleep_ms(ms: u64) {
    let hz = tick_hz() as u64;
    let target = ticks() + ms * hz / 1000;
    while ticks() < target {
        crate::arch::idle();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn tick_once() {
        timer_interrupt(&InterruptContext {
            vector: interrupts::TIMER_VECTOR,
            error_code: 0,
            instruction_pointer: 0,
            stack_pointer: 0,
            cpu_flags: 0,
            code_segment: 0,
            stack_segment: 0,
        });
    }

    // Tests in this module share the global tick counter, so assertions
    // are monotonic rather than exact.
    #[test]
    fn ticks_advance_with_interrupts() {
        let before = ticks();
        for _ in 0..250 {
            tick_once();
        }
        assert!(ticks() - before >= 250);
    }

    #[test]
    fn uptime_follows_tick_rate() {
        TICK_HZ.store(1000, Ordering::Relaxed);
        tick_once();
        let now = ticks();
        // At 1000 Hz one tick is one millisecond.
        assert_eq!(now * 1000 / tick_hz() as u64, now);
        assert!(uptime_ms() >= 1);
    }

    #[test]
    fn callback_receives_running_count() {
        use core::sync::atomic::AtomicU64;
        static LAST_SEEN: AtomicU64 = AtomicU64::new(0);

        fn probe(now: u64) {
            LAST_SEEN.store(now, Ordering::SeqCst);
        }

        register_tick_callback(probe);
        tick_once();
        let seen = LAST_SEEN.load(Ordering::SeqCst);
        assert!(seen >= 1);
        assert!(seen <= ticks());
        *TICK_CALLBACK.lock() = None;
    }
}
