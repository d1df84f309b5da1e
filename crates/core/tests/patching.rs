//! Patch lifecycle against real process memory

use vulpes_core::{
    branch_target, Address, CodeMemory, CodePatch, Condition, EngineConfig, EngineContext,
    EngineError, IntegrityStatus, PatchKind, ProcessMemory,
};

/// A page of `int3` with a recognizable function prologue at +0x40
struct Page {
    alloc: region::Allocation,
}

impl Page {
    const SITE: usize = 0x40;

    fn new() -> Self {
        let mut alloc =
            region::alloc(region::page::size(), region::Protection::READ_WRITE).unwrap();
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(alloc.as_mut_ptr::<u8>(), alloc.len())
        };
        bytes.fill(0xCC);
        bytes[Self::SITE..Self::SITE + 9]
            .copy_from_slice(&[0x83, 0xC4, 0x10, 0x85, 0xC0, 0x74, 0x12, 0x8B, 0x08]);

        unsafe {
            region::protect(alloc.as_ptr::<u8>(), alloc.len(), region::Protection::READ_EXECUTE)
                .unwrap();
        }
        Self { alloc }
    }

    fn base(&self) -> Address {
        Address::from_ptr(self.alloc.as_ptr::<u8>())
    }

    fn at(&self, offset: usize) -> Address {
        Address::new(self.base().get() + offset)
    }

    fn end(&self) -> Address {
        self.at(self.alloc.len())
    }

    fn bytes(&self) -> Vec<u8> {
        ProcessMemory::new()
            .read_vec(self.base(), self.alloc.len())
            .unwrap()
    }
}

fn context(page: &Page) -> EngineContext {
    EngineContext::new(Box::new(ProcessMemory::new()), EngineConfig::default())
        .with_discovered_range(page.base(), page.end())
}

#[test]
fn test_apply_revert_round_trip() {
    let page = Page::new();
    let before = page.bytes();
    let memory = ProcessMemory::new();

    let mut patch = CodePatch::at_address("nop", page.at(Page::SITE + 5), 2, PatchKind::Nop);
    patch.build(&memory, Address::NULL).unwrap();
    assert_eq!(patch.original_bytes().as_slice(), &[0x74, 0x12]);
    assert_eq!(page.bytes(), before);

    patch.apply(&memory).unwrap();
    assert_eq!(
        memory.read_vec(page.at(Page::SITE + 5), 2).unwrap(),
        vec![0x90, 0x90]
    );

    patch.revert(&memory).unwrap();
    assert_eq!(page.bytes(), before);

    // The page keeps its execute-only protection after each write
    let info = region::query(page.alloc.as_ptr::<u8>()).unwrap();
    assert_eq!(info.protection(), region::Protection::READ_EXECUTE);
}

#[test]
fn test_repeated_calls_are_idempotent() {
    let page = Page::new();
    let memory = ProcessMemory::new();

    let mut patch = CodePatch::at_address("int3", page.at(Page::SITE), 3, PatchKind::Interrupt);
    patch.build(&memory, Address::NULL).unwrap();
    patch.build(&memory, Address::NULL).unwrap();
    assert_eq!(patch.original_bytes().as_slice(), &[0x83, 0xC4, 0x10]);

    patch.apply(&memory).unwrap();
    patch.apply(&memory).unwrap();
    assert!(patch.is_applied());
    assert_eq!(patch.live_bytes(&memory).unwrap().as_slice(), &[0xCC; 3]);

    patch.revert(&memory).unwrap();
    patch.revert(&memory).unwrap();
    assert!(!patch.is_applied());
    assert_eq!(
        patch.live_bytes(&memory).unwrap().as_slice(),
        &[0x83, 0xC4, 0x10]
    );
}

#[test]
fn test_tampering_is_reported_and_revert_still_restores() {
    let page = Page::new();
    let before = page.bytes();
    let memory = ProcessMemory::new();

    let mut patch = CodePatch::at_address("nop", page.at(Page::SITE), 4, PatchKind::Nop);
    patch.build(&memory, Address::NULL).unwrap();
    patch.apply(&memory).unwrap();

    memory.write(page.at(Page::SITE + 2), &[0xAB]).unwrap();
    assert_eq!(
        patch.check_integrity(&memory).unwrap(),
        IntegrityStatus::Mismatch {
            offset: 2,
            expected: 0x90,
            found: 0xAB,
        }
    );

    patch.revert(&memory).unwrap();
    assert_eq!(page.bytes(), before);
    assert!(patch.check_integrity(&memory).unwrap().is_intact());
}

#[test]
fn test_skip_jumps_to_end_of_region() {
    let page = Page::new();
    let memory = ProcessMemory::new();

    let mut patch = CodePatch::at_address("skip", page.at(Page::SITE), 8, PatchKind::Skip);
    patch.build(&memory, Address::NULL).unwrap();
    patch.apply(&memory).unwrap();

    assert_eq!(
        memory.read_vec(page.at(Page::SITE), 8).unwrap(),
        vec![0xEB, 0x06, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90]
    );
}

#[test]
fn test_jump_displacements() {
    let page = Page::new();
    let memory = ProcessMemory::new();

    let forward_at = page.at(0x10);
    let forward_to = page.at(0x200);
    let mut forward = CodePatch::at_address("forward", forward_at, 5, PatchKind::Jump)
        .with_redirect(forward_to);
    forward.build(&memory, Address::NULL).unwrap();
    assert_eq!(
        forward.patched_bytes().as_slice(),
        &[0xE9, 0xEB, 0x01, 0x00, 0x00]
    );

    let backward_at = page.at(0x300);
    let backward_to = page.at(0x100);
    let mut backward = CodePatch::at_address("backward", backward_at, 7, PatchKind::Jump)
        .with_redirect(backward_to);
    backward.build(&memory, Address::NULL).unwrap();
    assert_eq!(
        backward.patched_bytes().as_slice(),
        &[0xE9, 0xFB, 0xFD, 0xFF, 0xFF, 0x90, 0x90]
    );

    forward.apply(&memory).unwrap();
    backward.apply(&memory).unwrap();
    assert_eq!(branch_target(&memory, forward_at).unwrap(), forward_to);
    assert_eq!(branch_target(&memory, backward_at).unwrap(), backward_to);
}

#[test]
fn test_conditional_jump_and_call() {
    let page = Page::new();
    let memory = ProcessMemory::new();
    let target = page.at(0x400);

    let mut jne = CodePatch::at_address(
        "jne",
        page.at(0x20),
        6,
        PatchKind::ConditionalJump(Condition::NotEqual),
    )
    .with_redirect(target);
    jne.build(&memory, Address::NULL).unwrap();
    assert_eq!(&jne.patched_bytes()[..2], &[0x0F, 0x85]);

    let mut call = CodePatch::at_address("call", page.at(0x80), 5, PatchKind::Call)
        .with_redirect(target);
    call.build(&memory, Address::NULL).unwrap();
    assert_eq!(call.patched_bytes()[0], 0xE8);

    jne.apply(&memory).unwrap();
    call.apply(&memory).unwrap();
    assert_eq!(branch_target(&memory, page.at(0x20)).unwrap(), target);
    assert_eq!(branch_target(&memory, page.at(0x80)).unwrap(), target);
}

#[test]
fn test_signature_patch_through_context() {
    let page = Page::new();
    let before = page.bytes();
    let mut ctx = context(&page);

    let frags = ctx
        .add_pattern("AddFrags", true, "83 C4 10 85 C0 74 ? 8B 08")
        .unwrap();
    let patch = ctx.add_patch(CodePatch::at_signature("skip_check", frags, 5, 2, PatchKind::Nop));

    let report = ctx.init_all().unwrap();
    assert_eq!(report.applied, 1);
    assert!(report.disabled.is_empty());
    assert_eq!(ctx.resolve(frags).unwrap(), page.at(Page::SITE));
    assert_eq!(ctx.patch(patch).unwrap().address(), page.at(Page::SITE + 5));
    assert_eq!(
        ctx.memory().read_vec(page.at(Page::SITE + 5), 2).unwrap(),
        vec![0x90, 0x90]
    );

    assert_eq!(ctx.teardown(), 0);
    assert_eq!(page.bytes(), before);
}

#[test]
fn test_undersized_region_is_rejected() {
    let page = Page::new();
    let memory = ProcessMemory::new();
    let before = page.bytes();

    let mut patch = CodePatch::at_address("tiny", page.at(0x10), 4, PatchKind::Jump)
        .with_redirect(page.at(0x100));
    assert!(matches!(
        patch.build(&memory, Address::NULL),
        Err(EngineError::PatchSizeTooSmall { minimum: 5, .. })
    ));
    assert!(!patch.is_built());
    assert_eq!(page.bytes(), before);
}
