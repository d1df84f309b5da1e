//! The tick cave
//!
//! The host's per-frame function starts with
//! `push ecx; push ebx; push 0x000FFFFF`, seven bytes that are lifted into a
//! cave. The cave's callbacks drain the `PreTick` and `Tick` hook lists.

use vulpes_core::{
    pattern, CaveKey, CavePolicy, CodeCave, EngineContext, EngineResult, HookEvent, PatchTarget,
    Signature,
};

/// Bytes covered by the redirect
pub const TICK_SITE_LEN: usize = 7;

/// Run the hooks for `event`, if the engine is loaded
pub fn dispatch(event: HookEvent) -> usize {
    match vulpes_engine::hooks() {
        Some(hooks) => hooks.invoke(event),
        None => 0,
    }
}

extern "C" fn before_tick() -> bool {
    dispatch(HookEvent::PreTick);
    true
}

extern "C" fn after_tick() {
    dispatch(HookEvent::Tick);
}

/// Declare the tick signature and its cave on `ctx`
pub fn install(ctx: &mut EngineContext) -> EngineResult<CaveKey> {
    let signature = ctx.add_signature(Signature::new(
        "Tick",
        true,
        pattern!("51 53 68 FF FF 0F 00 68 1F 00 09 00 C6 05 ? ? ? ? 01"),
    ));

    let cave = CodeCave::with_callbacks(
        "tick",
        PatchTarget::Signature {
            signature,
            offset: 0,
        },
        TICK_SITE_LEN,
        before_tick,
        after_tick,
    )
    .with_policy(CavePolicy::AlwaysRunOriginal);

    Ok(ctx.add_cave(cave))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vulpes_core::{Address, EngineConfig, ImageMemory};

    const BASE: Address = Address::new(0x40_1000);

    fn at(offset: usize) -> Address {
        Address::new(BASE.get() + offset)
    }

    fn host_code() -> Vec<u8> {
        let mut code = vec![0xCC; 0x80];
        code[0x20..0x33].copy_from_slice(&[
            0x51, 0x53, 0x68, 0xFF, 0xFF, 0x0F, 0x00, 0x68, 0x1F, 0x00, 0x09, 0x00, 0xC6, 0x05,
            0x10, 0x20, 0x30, 0x40, 0x01,
        ]);
        code
    }

    fn context(code: Vec<u8>) -> EngineContext {
        let memory = ImageMemory::with_scratch(BASE, code, 0x100);
        EngineContext::new(Box::new(memory), EngineConfig::default())
            .with_discovered_range(BASE, at(0x80))
    }

    #[test]
    fn test_tick_cave_installs_over_signature() {
        let mut ctx = context(host_code());

        let key = install(&mut ctx).unwrap();
        let report = ctx.init_all().unwrap();
        assert_eq!(report.applied, 1);

        let cave = ctx.cave(key).unwrap();
        assert!(cave.is_applied());
        assert_eq!(cave.redirect().address(), at(0x20));
        assert_eq!(cave.continuation(), at(0x27));
        assert_eq!(cave.before(), Address::new(before_tick as usize));
        assert_eq!(
            vulpes_core::branch_target(ctx.memory(), at(0x20)).unwrap(),
            cave.glue_address()
        );

        assert_eq!(ctx.teardown(), 0);
        assert_eq!(ctx.memory().read_vec(BASE, 0x80).unwrap(), host_code());
    }

    #[test]
    fn test_missing_tick_is_fatal() {
        let mut ctx = context(vec![0xCC; 0x80]);

        install(&mut ctx).unwrap();
        assert!(ctx.init_all().is_err());
    }
}
