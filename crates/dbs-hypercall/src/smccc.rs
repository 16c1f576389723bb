// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Hypercall encoding over the ARM SMC Calling Convention.

use crate::{
    CapId, DonateOptions, HypError, HypIdentity, Hypercall, MapFlags, MemExtentAttrs, Result,
};

const SMCCC_FAST_CALL: u32 = 1 << 31;
const SMCCC_SMC_64: u32 = 1 << 30;
const SMCCC_OWNER_SHIFT: u32 = 24;
const SMCCC_OWNER_VENDOR_HYP: u32 = 6;

const fn vendor_hyp_call(func: u32) -> u32 {
    SMCCC_FAST_CALL | SMCCC_SMC_64 | (SMCCC_OWNER_VENDOR_HYP << SMCCC_OWNER_SHIFT) | (func & 0xffff)
}

/// Function identifier of `identify`.
pub const HYPERCALL_HYP_IDENTIFY: u32 = vendor_hyp_call(0x8000);
/// Function identifier of `addrspace_map`.
pub const HYPERCALL_ADDRSPACE_MAP: u32 = vendor_hyp_call(0x802b);
/// Function identifier of `addrspace_unmap`.
pub const HYPERCALL_ADDRSPACE_UNMAP: u32 = vendor_hyp_call(0x802c);
/// Function identifier of `memextent_donate`.
pub const HYPERCALL_MEMEXTENT_DONATE: u32 = vendor_hyp_call(0x8061);
/// Function identifier of the standard vendor hypervisor UID query (32-bit fast call).
pub const VENDOR_HYP_CALL_UID_FUNC_ID: u32 =
    SMCCC_FAST_CALL | (SMCCC_OWNER_VENDOR_HYP << SMCCC_OWNER_SHIFT) | 0xff01;

const GUNYAH_UID: [u8; 16] = [
    0xc1, 0xd5, 0x8f, 0xcd, 0xa4, 0x53, 0x5f, 0xdb, 0x92, 0x65, 0xce, 0x36, 0x67, 0x3d, 0x5f, 0x14,
];

/// Argument registers of an SMCCC call: the function identifier followed by eight arguments.
pub type SmcccArgs = [u64; 9];
/// Result registers of an SMCCC call.
pub type SmcccRes = [u64; 8];

/// Conduit issuing raw SMCCC calls, typically an `hvc #0` instruction.
pub trait SmcccTransport: Send + Sync {
    /// Issue the call described by `args` and return the result registers.
    fn call(&self, args: &SmcccArgs) -> SmcccRes;
}

/// [Hypercall] implementation encoding every call into SMCCC registers.
pub struct SmcccHypercalls<T> {
    transport: T,
}

impl<T: SmcccTransport> SmcccHypercalls<T> {
    /// Create a new hypercall interface over `transport`.
    pub fn new(transport: T) -> Self {
        SmcccHypercalls { transport }
    }

    /// Get the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Check whether the vendor hypervisor behind the conduit is Gunyah.
    pub fn is_gunyah(&self) -> bool {
        let mut args = [0u64; 9];
        args[0] = VENDOR_HYP_CALL_UID_FUNC_ID as u64;
        let res = self.transport.call(&args);

        let mut uid = [0u8; 16];
        for (i, chunk) in uid.chunks_mut(4).enumerate() {
            chunk.copy_from_slice(&(res[i] as u32).to_le_bytes());
        }
        uid == GUNYAH_UID
    }

    fn call(&self, func: u32, params: &[u64]) -> SmcccRes {
        let mut args = [0u64; 9];
        args[0] = func as u64;
        args[1..=params.len()].copy_from_slice(params);
        self.transport.call(&args)
    }
}

impl<T: SmcccTransport> Hypercall for SmcccHypercalls<T> {
    fn identify(&self) -> HypIdentity {
        let res = self.call(HYPERCALL_HYP_IDENTIFY, &[]);
        HypIdentity {
            api_info: res[0],
            flags: [res[1], res[2], res[3]],
        }
    }

    fn memextent_donate(
        &self,
        options: DonateOptions,
        from: CapId,
        to: CapId,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        let res = self.call(
            HYPERCALL_MEMEXTENT_DONATE,
            &[options.bits() as u64, from, to, offset, size, 0],
        );
        HypError::from_raw(res[0])
    }

    fn addrspace_map(
        &self,
        addrspace: CapId,
        extent: CapId,
        vbase: u64,
        attrs: MemExtentAttrs,
        flags: MapFlags,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        let res = self.call(
            HYPERCALL_ADDRSPACE_MAP,
            &[
                addrspace,
                extent,
                vbase,
                attrs.bits() as u64,
                flags.bits() as u64,
                offset,
                size,
                0,
            ],
        );
        HypError::from_raw(res[0])
    }

    fn addrspace_unmap(
        &self,
        addrspace: CapId,
        extent: CapId,
        vbase: u64,
        flags: MapFlags,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        let res = self.call(
            HYPERCALL_ADDRSPACE_UNMAP,
            &[addrspace, extent, vbase, flags.bits() as u64, offset, size, 0],
        );
        HypError::from_raw(res[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DonateType, PagetableAccess, DEFAULT_MEMTYPE};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<SmcccArgs>>,
        response: SmcccRes,
    }

    impl SmcccTransport for RecordingTransport {
        fn call(&self, args: &SmcccArgs) -> SmcccRes {
            self.calls.lock().unwrap().push(*args);
            self.response
        }
    }

    fn last_call(hyp: &SmcccHypercalls<RecordingTransport>) -> SmcccArgs {
        *hyp.transport().calls.lock().unwrap().last().unwrap()
    }

    #[test]
    fn test_function_ids() {
        assert_eq!(HYPERCALL_HYP_IDENTIFY, 0xc600_8000);
        assert_eq!(HYPERCALL_ADDRSPACE_MAP, 0xc600_802b);
        assert_eq!(HYPERCALL_ADDRSPACE_UNMAP, 0xc600_802c);
        assert_eq!(HYPERCALL_MEMEXTENT_DONATE, 0xc600_8061);
        assert_eq!(VENDOR_HYP_CALL_UID_FUNC_ID, 0x8600_ff01);
    }

    #[test]
    fn test_donate_registers() {
        let hyp = SmcccHypercalls::new(RecordingTransport::default());
        let opts = DonateOptions::new(DonateType::ToProtected);
        hyp.memextent_donate(opts, 10, 11, 0x2000, 0x1000).unwrap();
        assert_eq!(
            last_call(&hyp),
            [0xc600_8061, 3, 10, 11, 0x2000, 0x1000, 0, 0, 0]
        );
    }

    #[test]
    fn test_map_registers() {
        let hyp = SmcccHypercalls::new(RecordingTransport::default());
        let attrs = MemExtentAttrs::new(DEFAULT_MEMTYPE, PagetableAccess::RW, PagetableAccess::RW);
        let flags = MapFlags::PARTIAL | MapFlags::VMMIO;
        hyp.addrspace_map(1, 2, 0x8000_0000, attrs, flags, 0x3000, 0x1000)
            .unwrap();
        assert_eq!(
            last_call(&hyp),
            [
                0xc600_802b,
                1,
                2,
                0x8000_0000,
                attrs.bits() as u64,
                0x5,
                0x3000,
                0x1000,
                0
            ]
        );
    }

    #[test]
    fn test_unmap_registers() {
        let hyp = SmcccHypercalls::new(RecordingTransport::default());
        let flags = MapFlags::PARTIAL | MapFlags::PRIVATE;
        hyp.addrspace_unmap(1, 3, 0x4000, flags, 0x1000, 0x1000)
            .unwrap();
        assert_eq!(
            last_call(&hyp),
            [0xc600_802c, 1, 3, 0x4000, 0x3, 0x1000, 0x1000, 0, 0]
        );
    }

    #[test]
    fn test_error_status() {
        let transport = RecordingTransport {
            response: [(-2i64) as u64, 0, 0, 0, 0, 0, 0, 0],
            ..Default::default()
        };
        let hyp = SmcccHypercalls::new(transport);
        let opts = DonateOptions::new(DonateType::ToSibling);
        assert_eq!(
            hyp.memextent_donate(opts, 1, 2, 0, 0x1000),
            Err(HypError::Retry)
        );
    }

    #[test]
    fn test_identify() {
        let transport = RecordingTransport {
            response: [(1 << 15) | 1, 1 << 6, 0, 0, 0, 0, 0, 0],
            ..Default::default()
        };
        let hyp = SmcccHypercalls::new(transport);
        let identity = hyp.identify();
        assert_eq!(identity.api_version(), 1);
        assert!(identity.has_feature(crate::Feature::MemExtent));
        assert_eq!(last_call(&hyp)[0], 0xc600_8000);
    }

    #[test]
    fn test_is_gunyah() {
        let mut response = [0u64; 8];
        for (i, chunk) in GUNYAH_UID.chunks(4).enumerate() {
            let mut word = [0u8; 4];
            word.copy_from_slice(chunk);
            response[i] = u32::from_le_bytes(word) as u64;
        }
        let hyp = SmcccHypercalls::new(RecordingTransport {
            response,
            ..Default::default()
        });
        assert!(hyp.is_gunyah());

        let hyp = SmcccHypercalls::new(RecordingTransport::default());
        assert!(!hyp.is_gunyah());
    }
}
