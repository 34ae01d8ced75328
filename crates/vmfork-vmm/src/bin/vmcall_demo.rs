//! Demonstrate the call/fork/reset cycle:
//! 1. Build a tiny guest in memory (no toolchain needed)
//! 2. Call it like a function
//! 3. Prepare copy-on-write and fork
//! 4. Let the fork dirty a page, then reset it
//! 5. Time a batch of call+reset rounds
//!
//! Usage: cargo run --release --bin vmcall_demo

use std::time::Instant;
use vmfork_vmm::layout::PAGE_SIZE;
use vmfork_vmm::{testelf, Machine, MachineOptions, VmArg};

const BASE: u64 = 0x40_0000;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Guest: `lea rax, [rdi + rsi] ; ret` followed by
    // `mov byte [data], 0x5a ; ret` at offset 8.
    let data_addr = BASE + testelf::DATA_OFFSET;
    let mut code = vec![0x48, 0x8d, 0x04, 0x37, 0xc3, 0x90, 0x90, 0x90];
    code.extend_from_slice(&[0xc6, 0x04, 0x25]);
    code.extend_from_slice(&(data_addr as u32).to_le_bytes());
    code.extend_from_slice(&[0x5a, 0xc3]);
    let elf = testelf::static_executable(BASE, &code, &[0u8; 64]);

    let options = MachineOptions::default();
    let entry = BASE + testelf::CODE_OFFSET;

    // === Phase 1: call the guest directly ===
    log::info!("=== Phase 1: direct call ===");
    let mut vm = Machine::new(&elf, &options).expect("failed to create machine");
    let sum = vm
        .vmcall(entry, &[VmArg::U64(40), VmArg::U64(2)])
        .expect("vmcall failed");
    log::info!("guest add(40, 2) = {sum}");
    assert_eq!(sum, 42);

    // === Phase 2: prepare and fork ===
    log::info!("=== Phase 2: prepare copy-on-write, fork ===");
    vm.prepare_copy_on_write().expect("prepare failed");
    let mut fork = Machine::fork(&vm, &options).expect("fork failed");

    fork.vmcall(entry + 8, &[]).expect("fork call failed");
    let mut byte = [0u8; 1];
    fork.copy_from_guest(&mut byte, data_addr).unwrap();
    log::info!(
        "fork wrote 0x{:02x}, {} page(s) banked",
        byte[0],
        fork.banked_memory_pages()
    );

    vm.copy_from_guest(&mut byte, data_addr).unwrap();
    log::info!("parent still reads 0x{:02x}", byte[0]);

    // === Phase 3: reset between requests ===
    log::info!("=== Phase 3: reset ===");
    fork.reset_to(&vm, &options).expect("reset failed");
    fork.copy_from_guest(&mut byte, data_addr).unwrap();
    log::info!(
        "after reset the fork reads 0x{:02x}, {} page(s) banked",
        byte[0],
        fork.banked_memory_pages()
    );

    // === Phase 4: throughput of the hot path ===
    log::info!("=== Phase 4: call+reset rounds ===");
    const ROUNDS: u32 = 2_000;
    let started = Instant::now();
    for i in 0..ROUNDS {
        let ret = fork
            .vmcall(entry, &[VmArg::U64(i as u64), VmArg::U64(1)])
            .expect("round call failed");
        assert_eq!(ret, i as i64 + 1);
        fork.reset_to(&vm, &options).expect("round reset failed");
    }
    let elapsed = started.elapsed();
    println!();
    println!("=== VMCALL DEMO RESULTS ===");
    println!("guest page size:     {PAGE_SIZE} bytes");
    println!("rounds:              {ROUNDS}");
    println!("total time:          {elapsed:?}");
    println!(
        "per call+reset:      {:.1} µs",
        elapsed.as_secs_f64() * 1e6 / ROUNDS as f64
    );
}
