// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shadow register bit layouts. Naming and bit assignments follow the 16550
//! UART's modem control and modem status registers.

use bitfield_struct::bitfield;

/// Modem control shadow register: the output lines an endpoint drives.
///
/// Only the endpoint's own control-line updates write this register.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct ModemControlRegister {
    /// Data Terminal Ready.
    pub dtr: bool,
    /// Request To Send.
    pub rts: bool,
    /// Local loopback. Stored and reported, never propagated.
    pub loopback: bool,
    /// Auxiliary output 1 (legacy). Does not propagate.
    pub out1: bool,
    /// Auxiliary output 2 (legacy). Does not propagate.
    pub out2: bool,
    #[bits(3)]
    reserved: u8,
}

/// Modem status shadow register: the input lines driven by the partner.
///
/// Written only by signal propagation, never directly by the endpoint owner.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct ModemStatusRegister {
    #[bits(4)]
    reserved: u8,
    /// Clear To Send, driven by the partner's RTS.
    pub cts: bool,
    /// Data Carrier Detect, driven by the partner's DTR.
    pub dcd: bool,
    /// Data Set Ready, driven by the partner's DTR.
    pub dsr: bool,
    /// Ring Indicator. A null modem cable never drives this line.
    pub ri: bool,
}

/// A set of modem status lines, used as the interest mask for
/// [`wait_for_change`](crate::NullModem::wait_for_change).
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct StatusLines {
    /// Clear To Send.
    pub cts: bool,
    /// Data Set Ready.
    pub dsr: bool,
    /// Data Carrier Detect.
    pub dcd: bool,
    /// Ring Indicator.
    pub ring: bool,
    #[bits(4)]
    reserved: u8,
}

/// Recomputes one endpoint's status register from its partner's control
/// register.
///
/// RTS on the partner drives CTS; DTR drives both DSR and DCD. A partner
/// with no open session drives nothing, whatever its stale control register
/// still holds. Pure bit logic: no side effects, and identical inputs always
/// produce identical output.
pub fn propagate(partner_mcr: ModemControlRegister, partner_open: bool) -> ModemStatusRegister {
    if !partner_open {
        return ModemStatusRegister::new();
    }
    ModemStatusRegister::new()
        .with_cts(partner_mcr.rts())
        .with_dsr(partner_mcr.dtr())
        .with_dcd(partner_mcr.dtr())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rts_drives_cts() {
        let msr = propagate(ModemControlRegister::new().with_rts(true), true);
        assert!(msr.cts());
        assert!(!msr.dsr());
        assert!(!msr.dcd());
        assert!(!msr.ri());
    }

    #[test]
    fn dtr_drives_dsr_and_dcd() {
        let msr = propagate(ModemControlRegister::new().with_dtr(true), true);
        assert!(!msr.cts());
        assert!(msr.dsr());
        assert!(msr.dcd());
        assert!(!msr.ri());
    }

    #[test]
    fn closed_partner_drives_nothing() {
        let mcr = ModemControlRegister::new().with_dtr(true).with_rts(true);
        assert_eq!(u8::from(propagate(mcr, false)), 0);
    }

    #[test]
    fn auxiliary_bits_do_not_propagate() {
        let mcr = ModemControlRegister::new()
            .with_loopback(true)
            .with_out1(true)
            .with_out2(true);
        assert_eq!(u8::from(propagate(mcr, true)), 0);
    }

    #[test]
    fn propagate_is_pure() {
        let mcr = ModemControlRegister::new().with_dtr(true).with_rts(true);
        assert_eq!(propagate(mcr, true), propagate(mcr, true));
        assert_eq!(propagate(mcr, false), propagate(mcr, false));
    }

    #[test]
    fn bit_assignments_match_the_uart_layout() {
        assert_eq!(u8::from(ModemControlRegister::new().with_dtr(true)), 0x01);
        assert_eq!(u8::from(ModemControlRegister::new().with_rts(true)), 0x02);
        assert_eq!(u8::from(ModemControlRegister::new().with_loopback(true)), 0x04);
        assert_eq!(u8::from(ModemControlRegister::new().with_out1(true)), 0x08);
        assert_eq!(u8::from(ModemControlRegister::new().with_out2(true)), 0x10);
        assert_eq!(u8::from(ModemStatusRegister::new().with_cts(true)), 0x10);
        assert_eq!(u8::from(ModemStatusRegister::new().with_dcd(true)), 0x20);
        assert_eq!(u8::from(ModemStatusRegister::new().with_dsr(true)), 0x40);
        assert_eq!(u8::from(ModemStatusRegister::new().with_ri(true)), 0x80);
    }
}
