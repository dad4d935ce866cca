//! Host-Target Interface: the `tohost`/`fromhost` mailbox pair used for
//! console I/O and machine control. Dispatch grounded in the source's
//! `htif_handle_cmd`: `device = tohost>>56`, `cmd = (tohost>>48)&0xff`,
//! `payload = tohost & mask`.
use super::{zero_page, DeviceHost, PeekOutcome};
use crate::primitives::constants::PAGE_SIZE;

pub const TOHOST: u64 = 0;
pub const FROMHOST: u64 = 8;

fn page_base(v: u64) -> u64 {
    v - (v % PAGE_SIZE)
}

fn page_offset(v: u64) -> usize {
    (v % PAGE_SIZE) as usize
}

pub fn read(host: &dyn DeviceHost, offset: u64, size_log2: u32) -> Option<u64> {
    match offset {
        TOHOST if size_log2 == 3 => Some(host.read_htif_tohost()),
        FROMHOST if size_log2 == 3 => Some(host.read_htif_fromhost()),
        _ => None,
    }
}

pub fn write(host: &mut dyn DeviceHost, offset: u64, val: u64, size_log2: u32) -> bool {
    match offset {
        TOHOST if size_log2 == 3 => {
            host.write_htif_tohost(val);
            dispatch(host, val);
            true
        }
        FROMHOST if size_log2 == 3 => {
            host.write_htif_fromhost(val);
            true
        }
        _ => false,
    }
}

fn dispatch(host: &mut dyn DeviceHost, tohost: u64) {
    let device = tohost >> 56;
    let cmd = (tohost >> 48) & 0xff;
    let payload = tohost & ((1u64 << 48) - 1);
    tracing::trace!(device, cmd, payload, "HTIF dispatch");
    match (device, cmd) {
        (0, 0) => {
            if payload & 1 != 0 {
                host.halt();
            }
        }
        (1, 1) => {
            host.console_putchar((payload & 0xff) as u8);
            host.write_htif_tohost(0);
        }
        (1, 0) => {
            host.request_console_getchar();
        }
        (2, 0) => {
            if host.yield_manual_enabled() {
                host.request_yield();
            }
        }
        (2, 1) => {
            if host.yield_automatic_enabled() {
                host.request_yield();
            }
        }
        _ => {}
    }
}

pub fn peek(host: &dyn DeviceHost, page_index: u64) -> PeekOutcome {
    match page_index {
        p if p == page_base(TOHOST) => {
            let mut page = zero_page();
            let off = page_offset(TOHOST);
            page[off..off + 8].copy_from_slice(&host.read_htif_tohost().to_le_bytes());
            let off = page_offset(FROMHOST);
            page[off..off + 8].copy_from_slice(&host.read_htif_fromhost().to_le_bytes());
            PeekOutcome::Success(page)
        }
        p if p % PAGE_SIZE == 0 => PeekOutcome::Pristine,
        _ => PeekOutcome::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeHost {
        tohost: u64,
        fromhost: u64,
        console: Vec<u8>,
        halted: bool,
        getchar_requests: u32,
        yield_manual: bool,
        yield_automatic: bool,
        yielded: bool,
    }

    impl DeviceHost for FakeHost {
        fn read_mip(&self) -> u64 {
            0
        }
        fn set_mip(&mut self, _bits: u64) {}
        fn reset_mip(&mut self, _bits: u64) {}
        fn read_mcycle(&self) -> u64 {
            0
        }
        fn read_mtimecmp(&self) -> u64 {
            0
        }
        fn write_mtimecmp(&mut self, _val: u64) {}
        fn read_htif_tohost(&self) -> u64 {
            self.tohost
        }
        fn write_htif_tohost(&mut self, val: u64) {
            self.tohost = val;
        }
        fn read_htif_fromhost(&self) -> u64 {
            self.fromhost
        }
        fn write_htif_fromhost(&mut self, val: u64) {
            self.fromhost = val;
        }
        fn console_putchar(&mut self, byte: u8) {
            self.console.push(byte);
        }
        fn request_console_getchar(&mut self) {
            self.getchar_requests += 1;
        }
        fn halt(&mut self) {
            self.halted = true;
        }
        fn yield_manual_enabled(&self) -> bool {
            self.yield_manual
        }
        fn yield_automatic_enabled(&self) -> bool {
            self.yield_automatic
        }
        fn request_yield(&mut self) {
            self.yielded = true;
        }
    }

    #[test]
    fn putchar_dispatch_writes_console_and_acks() {
        let mut host = FakeHost::default();
        let tohost = (1u64 << 56) | (1u64 << 48) | (b'A' as u64);
        assert!(write(&mut host, TOHOST, tohost, 3));
        assert_eq!(host.console, vec![b'A']);
        assert_eq!(host.tohost, 0);
    }

    #[test]
    fn halt_dispatch_on_device0_cmd0_payload_bit0() {
        let mut host = FakeHost::default();
        write(&mut host, TOHOST, 1, 3);
        assert!(host.halted);
    }

    #[test]
    fn console_getchar_request_dispatch() {
        let mut host = FakeHost::default();
        let tohost = 1u64 << 56;
        write(&mut host, TOHOST, tohost, 3);
        assert_eq!(host.getchar_requests, 1);
    }

    #[test]
    fn manual_yield_parks_machine_only_when_enabled() {
        let mut host = FakeHost { yield_manual: false, ..FakeHost::default() };
        let tohost = 2u64 << 56;
        write(&mut host, TOHOST, tohost, 3);
        assert!(!host.yielded, "yield_manual disabled in config must not park the machine");

        let mut host = FakeHost { yield_manual: true, ..FakeHost::default() };
        write(&mut host, TOHOST, tohost, 3);
        assert!(host.yielded);
    }

    #[test]
    fn automatic_yield_parks_machine_only_when_enabled() {
        let mut host = FakeHost { yield_automatic: false, ..FakeHost::default() };
        let tohost = (2u64 << 56) | (1u64 << 48);
        write(&mut host, TOHOST, tohost, 3);
        assert!(!host.yielded);

        let mut host = FakeHost { yield_automatic: true, ..FakeHost::default() };
        write(&mut host, TOHOST, tohost, 3);
        assert!(host.yielded);
    }
}
