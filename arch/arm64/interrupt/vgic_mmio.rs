//! Emulated distributor/redistributor register windows
//!
//! Guest accesses to the GICD/GICR frames fault (the frames are never
//! stage-2 mapped) and land here through the MMIO framework. Decoding uses a
//! sorted table of (base, stride, count) windows per frame instead of
//! open-coded range comparisons, so each architectural register block is one
//! table entry and one operation.
//!
//! Identification fields (TYPER, IIDR, ...) are passed through from live
//! hardware; enable/priority/target are software state in the per-VM record
//! arrays, with enables and SPI routing mirrored to the physical controller.
//! The pending/active windows are intentionally unimplemented: delivery
//! state lives in the list registers only.

use crate::arch::arm64::interrupt::gic::{gicd, gicr, is_spi, IrqChip};
use crate::arch::arm64::interrupt::vgic::DistState;
use crate::config::GICR_STRIDE;
use crate::vmm::mmio::MmioAccess;
use crate::vmm::vcpu::Vcpu;
use crate::vmm::vm::{self, Vm};
use crate::{Error, Result};

/// Distributor register blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DistReg {
    Ctlr,
    Typer,
    Iidr,
    Typer2,
    Group,
    SetEnable,
    ClearEnable,
    SetPend,
    ClearPend,
    SetActive,
    ClearActive,
    Priority,
    Targets,
    Config,
    Router,
}

/// Redistributor register blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RedistReg {
    Ctlr,
    Iidr,
    Typer,
    Waker,
    Group0,
    SetEnable0,
    ClearEnable0,
    SetPend0,
    ClearPend0,
    SetActive0,
    ClearActive0,
    Priority,
    Config0,
    Config1,
    GrpMod0,
}

/// One contiguous register window: `count` registers of `stride` bytes
struct Window<R> {
    base: u64,
    stride: u64,
    count: u64,
    reg: R,
}

impl<R: Copy> Window<R> {
    const fn one(base: u64, stride: u64, reg: R) -> Self {
        Self { base, stride, count: 1, reg }
    }

    const fn many(base: u64, stride: u64, count: u64, reg: R) -> Self {
        Self { base, stride, count, reg }
    }
}

/// Sorted by base; looked up by binary partition.
const DIST_WINDOWS: &[Window<DistReg>] = &[
    Window::one(gicd::CTLR, 4, DistReg::Ctlr),
    Window::one(gicd::TYPER, 4, DistReg::Typer),
    Window::one(gicd::IIDR, 4, DistReg::Iidr),
    Window::one(gicd::TYPER2, 4, DistReg::Typer2),
    Window::many(gicd::IGROUPR, 4, 32, DistReg::Group),
    Window::many(gicd::ISENABLER, 4, 32, DistReg::SetEnable),
    Window::many(gicd::ICENABLER, 4, 32, DistReg::ClearEnable),
    Window::many(gicd::ISPENDR, 4, 32, DistReg::SetPend),
    Window::many(gicd::ICPENDR, 4, 32, DistReg::ClearPend),
    Window::many(gicd::ISACTIVER, 4, 32, DistReg::SetActive),
    Window::many(gicd::ICACTIVER, 4, 32, DistReg::ClearActive),
    Window::many(gicd::IPRIORITYR, 4, 255, DistReg::Priority),
    Window::many(gicd::ITARGETSR, 4, 255, DistReg::Targets),
    Window::many(gicd::ICFGR, 4, 64, DistReg::Config),
    // IROUTER<32..1019>; ids below 32 have no router register
    Window::many(gicd::IROUTER + 32 * 8, 8, 988, DistReg::Router),
];

const REDIST_WINDOWS: &[Window<RedistReg>] = &[
    Window::one(gicr::CTLR, 4, RedistReg::Ctlr),
    Window::one(gicr::IIDR, 4, RedistReg::Iidr),
    Window::one(gicr::TYPER, 8, RedistReg::Typer),
    Window::one(gicr::WAKER, 4, RedistReg::Waker),
    Window::one(gicr::IGROUPR0, 4, RedistReg::Group0),
    Window::one(gicr::ISENABLER0, 4, RedistReg::SetEnable0),
    Window::one(gicr::ICENABLER0, 4, RedistReg::ClearEnable0),
    Window::one(gicr::ISPENDR0, 4, RedistReg::SetPend0),
    Window::one(gicr::ICPENDR0, 4, RedistReg::ClearPend0),
    Window::one(gicr::ISACTIVER0, 4, RedistReg::SetActive0),
    Window::one(gicr::ICACTIVER0, 4, RedistReg::ClearActive0),
    Window::many(gicr::IPRIORITYR, 4, 8, RedistReg::Priority),
    Window::one(gicr::ICFGR0, 4, RedistReg::Config0),
    Window::one(gicr::ICFGR1, 4, RedistReg::Config1),
    Window::one(gicr::IGRPMODR0, 4, RedistReg::GrpMod0),
];

/// Resolve `offset` to (register block, index within the block)
fn window_lookup<R: Copy>(table: &[Window<R>], offset: u64) -> Option<(R, u64)> {
    let pos = table.partition_point(|w| w.base <= offset);
    if pos == 0 {
        return None;
    }
    let w = &table[pos - 1];
    if offset < w.base + w.stride * w.count {
        Some((w.reg, (offset - w.base) / w.stride))
    } else {
        None
    }
}

/// Gather 32 enable bits starting at `intid0`. Ids past the architectural
/// range read as zero; the last enable register covers ids 1020..1023 which
/// do not exist.
fn enable_mask(state: &mut DistState, vcpu_idx: usize, intid0: u32) -> Result<u64> {
    let mut mask = 0u64;
    for i in 0..32 {
        if let Ok(rec) = state.record(vcpu_idx, intid0 + i) {
            if rec.enabled {
                mask |= 1 << i;
            }
        }
    }
    Ok(mask)
}

/// Gather 4 priority bytes starting at `intid0`
fn priority_bytes(state: &mut DistState, vcpu_idx: usize, intid0: u32) -> Result<u64> {
    let mut val = 0u64;
    for i in 0..4 {
        val |= (state.record(vcpu_idx, intid0 + i)?.priority as u64) << (i * 8);
    }
    Ok(val)
}

fn dist_reg_read(
    state: &mut DistState,
    chip: &dyn IrqChip,
    vcpu_idx: usize,
    reg: DistReg,
    idx: u64,
    offset: u64,
) -> Result<u64> {
    let val = match reg {
        DistReg::Ctlr => {
            let mut ctlr = gicd::CTLR_ARE_NS as u64;
            if state.grp1ns_enabled {
                ctlr |= gicd::CTLR_G1NS_EN as u64;
            }
            ctlr
        }
        DistReg::Typer | DistReg::Iidr | DistReg::Typer2 => chip.gicd_read32(offset) as u64,
        // All interrupts are presented as Group 1
        DistReg::Group => 0xffff_ffff,
        DistReg::SetEnable | DistReg::ClearEnable => {
            enable_mask(state, vcpu_idx, idx as u32 * 32)?
        }
        DistReg::SetPend | DistReg::ClearPend | DistReg::SetActive | DistReg::ClearActive => {
            log::warn!("vgicd: pending/active window read (offset {:#x}) unimplemented", offset);
            0
        }
        DistReg::Priority => priority_bytes(state, vcpu_idx, idx as u32 * 4)?,
        DistReg::Targets => {
            let intid0 = idx as u32 * 4;
            let mut val = 0u64;
            for i in 0..4 {
                val |= (state.record(vcpu_idx, intid0 + i)?.target as u64) << (i * 8);
            }
            val
        }
        DistReg::Config => {
            log::warn!("vgicd: ICFGR<{}> read unimplemented", idx);
            0
        }
        DistReg::Router => {
            log::warn!("vgicd: IROUTER<{}> read unimplemented", idx + 32);
            0
        }
    };
    Ok(val)
}

fn dist_reg_write(
    state: &mut DistState,
    chip: &dyn IrqChip,
    vcpu_idx: usize,
    reg: DistReg,
    idx: u64,
    offset: u64,
    val: u64,
) -> Result<()> {
    match reg {
        DistReg::Ctlr => {
            // Software state only; the physical group enables were fixed at
            // boot and are not re-issued per guest write
            state.grp1ns_enabled = val & gicd::CTLR_G1NS_EN as u64 != 0;
        }
        DistReg::Typer | DistReg::Iidr | DistReg::Typer2 => {
            log::warn!("vgicd: write to read-only offset {:#x}", offset);
        }
        DistReg::Group => {
            // Everything stays Group 1; the write is accepted and dropped
            log::trace!("vgicd: IGROUPR<{}> write {:#x} ignored", idx, val);
        }
        DistReg::SetEnable => {
            let intid0 = idx as u32 * 32;
            for i in 0..32 {
                if val & (1 << i) != 0 {
                    state.record_mut(vcpu_idx, intid0 + i)?.enabled = true;
                    chip.enable_irq(intid0 + i);
                }
            }
        }
        DistReg::ClearEnable => {
            let intid0 = idx as u32 * 32;
            for i in 0..32 {
                if val & (1 << i) != 0 {
                    state.record_mut(vcpu_idx, intid0 + i)?.enabled = false;
                    chip.disable_irq(intid0 + i);
                }
            }
        }
        DistReg::SetPend | DistReg::ClearPend | DistReg::SetActive | DistReg::ClearActive => {
            log::warn!("vgicd: pending/active window write (offset {:#x}) unimplemented", offset);
        }
        DistReg::Priority => {
            let intid0 = idx as u32 * 4;
            for i in 0..4 {
                state.record_mut(vcpu_idx, intid0 + i)?.priority = (val >> (i * 8)) as u8;
            }
        }
        DistReg::Targets => {
            let intid0 = idx as u32 * 4;
            for i in 0..4 {
                let intid = intid0 + i;
                // Private interrupts cannot be retargeted
                if !is_spi(intid) {
                    log::error!("vgicd: ITARGETSR write for non-SPI id {}", intid);
                    return Err(Error::InvalidArgument);
                }
                let target = (val >> (i * 8)) as u8;
                state.record_mut(vcpu_idx, intid)?.target = target;
                chip.set_route_target(intid, target);
            }
        }
        DistReg::Config => {
            log::trace!("vgicd: ICFGR<{}> write {:#x} ignored", idx, val);
        }
        DistReg::Router => {
            let intid = idx as u32 + 32;
            chip.set_route_affinity(intid, val);
        }
    }
    Ok(())
}

fn redist_reg_read(
    state: &mut DistState,
    chip: &dyn IrqChip,
    frame: usize,
    reg: RedistReg,
    idx: u64,
) -> Result<u64> {
    let val = match reg {
        // LPIs are off and stay off
        RedistReg::Ctlr => 0,
        RedistReg::Iidr => chip.gicr_read64(frame, gicr::IIDR),
        RedistReg::Typer => chip.gicr_read64(frame, gicr::TYPER),
        // The hypervisor woke the redistributor long ago
        RedistReg::Waker => 0,
        RedistReg::Group0 => 0xffff_ffff,
        RedistReg::SetEnable0 | RedistReg::ClearEnable0 => enable_mask(state, frame, 0)?,
        RedistReg::SetPend0
        | RedistReg::ClearPend0
        | RedistReg::SetActive0
        | RedistReg::ClearActive0 => {
            log::warn!("vgicr: pending/active window read unimplemented");
            0
        }
        RedistReg::Priority => priority_bytes(state, frame, idx as u32 * 4)?,
        // SGIs are architecturally edge-triggered
        RedistReg::Config0 => 0xaaaa_aaaa,
        RedistReg::Config1 | RedistReg::GrpMod0 => {
            log::warn!("vgicr: unsupported register read");
            return Err(Error::NotFound);
        }
    };
    Ok(val)
}

fn redist_reg_write(
    state: &mut DistState,
    chip: &dyn IrqChip,
    frame: usize,
    reg: RedistReg,
    idx: u64,
    val: u64,
) -> Result<()> {
    match reg {
        RedistReg::Ctlr | RedistReg::Waker | RedistReg::Group0 => {
            log::trace!("vgicr: write {:#x} ignored", val);
        }
        RedistReg::Iidr | RedistReg::Typer => {
            log::warn!("vgicr: write to read-only register");
        }
        RedistReg::SetEnable0 => {
            for i in 0..32 {
                if val & (1 << i) != 0 {
                    state.record_mut(frame, i)?.enabled = true;
                    chip.enable_irq(i);
                }
            }
        }
        RedistReg::ClearEnable0 => {
            for i in 0..32 {
                if val & (1 << i) != 0 {
                    state.record_mut(frame, i)?.enabled = false;
                    chip.disable_irq(i);
                }
            }
        }
        RedistReg::SetPend0
        | RedistReg::ClearPend0
        | RedistReg::SetActive0
        | RedistReg::ClearActive0 => {
            log::warn!("vgicr: pending/active window write unimplemented");
        }
        RedistReg::Priority => {
            let intid0 = idx as u32 * 4;
            for i in 0..4 {
                state.record_mut(frame, intid0 + i)?.priority = (val >> (i * 8)) as u8;
            }
        }
        RedistReg::Config0 | RedistReg::Config1 | RedistReg::GrpMod0 => {
            log::trace!("vgicr: trigger/group-mod write {:#x} ignored", val);
        }
    }
    Ok(())
}

fn vm_of(vcpu: &Vcpu) -> Result<&'static Vm> {
    Ok(vm::get(vcpu.vm_id().ok_or(Error::InvalidState)?))
}

/// Distributor frame read callback
pub fn dist_read(vcpu: &mut Vcpu, offset: u64, val: &mut u64, _access: &MmioAccess) -> Result<()> {
    let vm = vm_of(vcpu)?;
    let chip = vm.vgic().chip()?;
    let Some((reg, idx)) = window_lookup(DIST_WINDOWS, offset) else {
        log::warn!("vgicd: read of unknown offset {:#x}", offset);
        *val = 0;
        return Ok(());
    };
    let mut state = vm.vgic().state.lock();
    *val = dist_reg_read(&mut state, chip, vcpu.vcpu_idx(), reg, idx, offset)?;
    Ok(())
}

/// Distributor frame write callback
pub fn dist_write(vcpu: &mut Vcpu, offset: u64, val: u64, _access: &MmioAccess) -> Result<()> {
    let vm = vm_of(vcpu)?;
    let chip = vm.vgic().chip()?;
    let Some((reg, idx)) = window_lookup(DIST_WINDOWS, offset) else {
        log::warn!("vgicd: write of unknown offset {:#x}", offset);
        return Ok(());
    };
    let mut state = vm.vgic().state.lock();
    dist_reg_write(&mut state, chip, vcpu.vcpu_idx(), reg, idx, offset, val)
}

/// Redistributor frame read callback. The frame index selects which vCPU's
/// banked state is addressed.
pub fn redist_read(vcpu: &mut Vcpu, offset: u64, val: &mut u64, _access: &MmioAccess) -> Result<()> {
    let vm = vm_of(vcpu)?;
    let chip = vm.vgic().chip()?;
    let frame = (offset / GICR_STRIDE) as usize;
    if frame >= vm.nvcpu() {
        log::error!("vgicr: frame {} beyond {} vcpus", frame, vm.nvcpu());
        return Err(Error::InvalidArgument);
    }
    let inner = offset % GICR_STRIDE;
    let Some((reg, idx)) = window_lookup(REDIST_WINDOWS, inner) else {
        log::warn!("vgicr: read of unknown offset {:#x}", inner);
        return Err(Error::NotFound);
    };
    let mut state = vm.vgic().state.lock();
    *val = redist_reg_read(&mut state, chip, frame, reg, idx)?;
    Ok(())
}

/// Redistributor frame write callback
pub fn redist_write(vcpu: &mut Vcpu, offset: u64, val: u64, _access: &MmioAccess) -> Result<()> {
    let vm = vm_of(vcpu)?;
    let chip = vm.vgic().chip()?;
    let frame = (offset / GICR_STRIDE) as usize;
    if frame >= vm.nvcpu() {
        log::error!("vgicr: frame {} beyond {} vcpus", frame, vm.nvcpu());
        return Err(Error::InvalidArgument);
    }
    let inner = offset % GICR_STRIDE;
    let Some((reg, idx)) = window_lookup(REDIST_WINDOWS, inner) else {
        log::warn!("vgicr: write of unknown offset {:#x}", inner);
        return Err(Error::NotFound);
    };
    let mut state = vm.vgic().state.lock();
    redist_reg_write(&mut state, chip, frame, reg, idx, val)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::arm64::interrupt::gic::fake::FakeGic;
    use crate::arch::arm64::interrupt::vgic::DistState;

    fn fresh_state(nvcpu: usize) -> DistState {
        let mut state = DistState::new();
        for idx in 0..nvcpu {
            // Banks come up like a VM construction would leave them
            state.record_mut(idx, 0).unwrap();
        }
        state
    }

    #[test]
    fn test_window_lookup() {
        assert_eq!(window_lookup(DIST_WINDOWS, 0x0), Some((DistReg::Ctlr, 0)));
        assert_eq!(window_lookup(DIST_WINDOWS, 0x4), Some((DistReg::Typer, 0)));
        assert_eq!(
            window_lookup(DIST_WINDOWS, gicd::ISENABLER + 4),
            Some((DistReg::SetEnable, 1))
        );
        assert_eq!(
            window_lookup(DIST_WINDOWS, gicd::IPRIORITYR + 48),
            Some((DistReg::Priority, 12))
        );
        assert_eq!(
            window_lookup(DIST_WINDOWS, gicd::IROUTER + 48 * 8),
            Some((DistReg::Router, 16))
        );
        // Hole between TYPER2 and IGROUPR
        assert_eq!(window_lookup(DIST_WINDOWS, 0x40), None);
        // Below the first window of the redistributor SGI page
        assert_eq!(window_lookup(REDIST_WINDOWS, gicr::SGI_BASE), None);
    }

    #[test]
    fn test_ctlr_tracks_group_enable() {
        let chip = FakeGic::new(4, 987);
        let mut state = fresh_state(1);

        let ctlr = dist_reg_read(&mut state, &chip, 0, DistReg::Ctlr, 0, 0).unwrap();
        assert_eq!(ctlr & gicd::CTLR_G1NS_EN as u64, 0);

        dist_reg_write(
            &mut state,
            &chip,
            0,
            DistReg::Ctlr,
            0,
            0,
            gicd::CTLR_G1NS_EN as u64,
        )
        .unwrap();
        assert!(state.grp1ns_enabled);

        let ctlr = dist_reg_read(&mut state, &chip, 0, DistReg::Ctlr, 0, 0).unwrap();
        assert_ne!(ctlr & gicd::CTLR_G1NS_EN as u64, 0);
        assert_ne!(ctlr & gicd::CTLR_ARE_NS as u64, 0);
    }

    #[test]
    fn test_enable_window_mirrors_hardware() {
        let chip = FakeGic::new(4, 987);
        let mut state = fresh_state(1);

        // ISENABLER<1> bit 16 -> SPI 48
        dist_reg_write(
            &mut state,
            &chip,
            0,
            DistReg::SetEnable,
            1,
            gicd::ISENABLER + 4,
            1 << 16,
        )
        .unwrap();
        assert!(state.record(0, 48).unwrap().enabled);
        assert!(chip.was_enabled(48));

        let mask = dist_reg_read(
            &mut state,
            &chip,
            0,
            DistReg::SetEnable,
            1,
            gicd::ISENABLER + 4,
        )
        .unwrap();
        assert_eq!(mask, 1 << 16);

        dist_reg_write(
            &mut state,
            &chip,
            0,
            DistReg::ClearEnable,
            1,
            gicd::ICENABLER + 4,
            1 << 16,
        )
        .unwrap();
        assert!(!state.record(0, 48).unwrap().enabled);
        assert!(chip.was_disabled(48));
    }

    #[test]
    fn test_priority_window_roundtrip() {
        let chip = FakeGic::new(4, 987);
        let mut state = fresh_state(1);

        // IPRIORITYR<12> covers ids 48..52
        dist_reg_write(
            &mut state,
            &chip,
            0,
            DistReg::Priority,
            12,
            gicd::IPRIORITYR + 48,
            0xa0b0_c0d0,
        )
        .unwrap();
        assert_eq!(state.record(0, 48).unwrap().priority, 0xd0);
        assert_eq!(state.record(0, 51).unwrap().priority, 0xa0);

        let val = dist_reg_read(
            &mut state,
            &chip,
            0,
            DistReg::Priority,
            12,
            gicd::IPRIORITYR + 48,
        )
        .unwrap();
        assert_eq!(val, 0xa0b0_c0d0);
    }

    #[test]
    fn test_targets_window_spi_only() {
        let chip = FakeGic::new(4, 987);
        let mut state = fresh_state(1);

        // ITARGETSR<12> covers SPIs 48..52
        dist_reg_write(
            &mut state,
            &chip,
            0,
            DistReg::Targets,
            12,
            gicd::ITARGETSR + 48,
            0x0000_0002,
        )
        .unwrap();
        assert_eq!(state.record(0, 48).unwrap().target, 2);
        assert_eq!(chip.state.lock().routed_target[0], (48, 2));

        // ITARGETSR<0> covers SGIs: retargeting privates is fatal
        assert_eq!(
            dist_reg_write(&mut state, &chip, 0, DistReg::Targets, 0, gicd::ITARGETSR, 1),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn test_router_window_programs_affinity() {
        let chip = FakeGic::new(4, 987);
        let mut state = fresh_state(1);

        dist_reg_write(
            &mut state,
            &chip,
            0,
            DistReg::Router,
            16,
            gicd::IROUTER + 48 * 8,
            0x0100,
        )
        .unwrap();
        assert_eq!(chip.state.lock().routed_aff[0], (48, 0x0100));
    }

    #[test]
    fn test_pending_windows_are_inert() {
        let chip = FakeGic::new(4, 987);
        let mut state = fresh_state(1);

        dist_reg_write(&mut state, &chip, 0, DistReg::SetPend, 1, gicd::ISPENDR + 4, !0).unwrap();
        let val =
            dist_reg_read(&mut state, &chip, 0, DistReg::SetPend, 1, gicd::ISPENDR + 4).unwrap();
        assert_eq!(val, 0);
        // Nothing leaked into hardware
        assert!(chip.state.lock().enabled.is_empty());
    }

    #[test]
    fn test_typer_passthrough() {
        let chip = FakeGic::new(4, 987);
        chip.state.lock().gicd_regs.insert(gicd::TYPER, 0x37a1_001e);
        let mut state = fresh_state(1);

        let val =
            dist_reg_read(&mut state, &chip, 0, DistReg::Typer, 0, gicd::TYPER).unwrap();
        assert_eq!(val, 0x37a1_001e);
    }

    #[test]
    fn test_redist_bank_is_per_frame() {
        let chip = FakeGic::new(4, 987);
        let mut state = fresh_state(2);

        // Enable PPI 27 through frame 1's window
        redist_reg_write(&mut state, &chip, 1, RedistReg::SetEnable0, 0, 1 << 27).unwrap();
        assert!(state.record(1, 27).unwrap().enabled);
        assert!(!state.record(0, 27).unwrap().enabled);

        let mask = redist_reg_read(&mut state, &chip, 1, RedistReg::SetEnable0, 0).unwrap();
        assert_ne!(mask & (1 << 27), 0);
    }

    #[test]
    fn test_redist_fixed_reads() {
        let chip = FakeGic::new(4, 987);
        let mut state = fresh_state(1);

        assert_eq!(redist_reg_read(&mut state, &chip, 0, RedistReg::Ctlr, 0).unwrap(), 0);
        assert_eq!(redist_reg_read(&mut state, &chip, 0, RedistReg::Waker, 0).unwrap(), 0);
        assert_eq!(
            redist_reg_read(&mut state, &chip, 0, RedistReg::Config0, 0).unwrap(),
            0xaaaa_aaaa
        );
        assert_eq!(
            redist_reg_read(&mut state, &chip, 0, RedistReg::Group0, 0).unwrap(),
            0xffff_ffff
        );
    }
}
