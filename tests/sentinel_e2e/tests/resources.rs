// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::fs;

use sentinel::{EnvId, Errno, KernelConfig, Perm, PAGE_SIZE, UTEXT};
use sentinel_e2e::{boot, free_frames, run_child};
use sentinel_rt::{fork, Machine, RtError};

#[test]
fn out_of_memory_leaves_no_mapping_and_no_leak() {
    let machine = boot(64);
    let env = machine.spawn().unwrap();
    let before = free_frames(&machine);

    // One data frame plus a table page on each side: every partial outcome must roll back.
    for budget in 0..3 {
        machine.with_kernel(|k| k.frames_mut().fail_after(Some(budget)));
        let err = env.page_alloc(EnvId::SELF, UTEXT, Perm::PUW).unwrap_err();
        assert_eq!(err, RtError::Errno(Errno::NoMem), "budget {budget}");
        assert!(env.uvpt(UTEXT).is_none());
        assert_eq!(free_frames(&machine), before, "budget {budget}");
    }

    machine.with_kernel(|k| k.frames_mut().fail_after(None));
    env.page_alloc(EnvId::SELF, UTEXT, Perm::PUW).unwrap();
    assert_eq!(free_frames(&machine), before - 3);
    let mirrored = machine.with_kernel(|k| k.env(env.id()).map(|e| e.space.is_mirrored()));
    assert_eq!(mirrored, Some(true));
}

#[test]
fn tearing_down_every_env_returns_every_frame() {
    let machine = boot(128);
    let capacity = machine.with_kernel(|k| k.frames().capacity());
    let parent = machine.spawn().unwrap();
    parent.page_alloc(EnvId::SELF, UTEXT, Perm::PUW).unwrap();
    parent.write_u32(UTEXT, 7).unwrap();
    let child = fork(&parent).unwrap();

    let handle = run_child(&parent, child, |env| env.write_u32(UTEXT, 8));
    handle.join().unwrap().unwrap();
    parent.write_u32(UTEXT, 9).unwrap();

    machine.with_kernel(|k| {
        k.destroy_env(child).unwrap();
        k.destroy_env(parent.id()).unwrap();
    });
    assert_eq!(free_frames(&machine), capacity);
    assert_eq!(machine.with_kernel(|k| k.envs().live_count()), 0);
}

#[test]
fn config_file_drives_boot() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("kernel.toml");
    fs::write(&path, "max_envs = 8\nframes = 32\n")?;

    let config = KernelConfig::load(&path)?;
    assert_eq!(config.max_envs, 8);
    assert_eq!(config.frames, 32);
    assert_eq!(config.nic_ring, KernelConfig::default().nic_ring);

    let machine = Machine::new(config)?;
    assert_eq!(free_frames(&machine), 32);
    for _ in 0..8 {
        machine.spawn()?;
    }
    assert_eq!(machine.spawn().unwrap_err(), RtError::Errno(Errno::NoFreeEnv));
    Ok(())
}

#[test]
fn bad_config_file_is_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("kernel.toml");
    fs::write(&path, "max_envs = 6\n")?;
    assert!(KernelConfig::load(&path).is_err());
    fs::write(&path, "max_env = 8\n")?;
    assert!(KernelConfig::load(&path).is_err());
    assert!(KernelConfig::load(&dir.path().join("missing.toml")).is_err());
    Ok(())
}

#[test]
fn heap_grows_down_in_whole_pages() {
    let machine = boot(64);
    let env = machine.spawn().unwrap();
    let top = machine.with_kernel(|k| k.config().heap_top);

    let brk = env.sbrk(1).unwrap();
    assert_eq!(brk, top - PAGE_SIZE);
    env.write_u32(brk, 3).unwrap();
    let again = env.sbrk(PAGE_SIZE).unwrap();
    assert_eq!(again, top - 2 * PAGE_SIZE);
    assert_eq!(env.read_u32(brk).unwrap(), 3);
    assert_eq!(env.uvpt(again).unwrap().perm, Perm::PUW);
}

#[test]
fn loopback_frames_round_trip_through_user_memory() {
    let machine = boot(64);
    let env = machine.spawn().unwrap();
    env.page_alloc(EnvId::SELF, UTEXT, Perm::PUW).unwrap();
    let frame = b"\xff\xff\xff\xff\xff\xffhello";
    env.write(UTEXT, frame).unwrap();

    env.net_send(UTEXT, frame.len()).unwrap();
    let rx = UTEXT + 0x800;
    let n = env.net_recv(rx, 0x100).unwrap();
    assert_eq!(n, frame.len());
    let mut back = vec![0u8; n];
    env.read(rx, &mut back).unwrap();
    assert_eq!(back, frame);
    assert_eq!(env.net_recv(rx, 0x100), Err(RtError::Errno(Errno::Again)));

    env.net_get_macaddr(UTEXT).unwrap();
    let mut mac = [0u8; 6];
    env.read(UTEXT, &mut mac).unwrap();
    assert_ne!(mac, [0u8; 6]);
}

#[test]
fn net_buffer_outside_writable_memory_kills_caller() {
    let machine = boot(64);
    let env = machine.spawn().unwrap();
    env.page_alloc(EnvId::SELF, UTEXT, Perm::PU).unwrap();
    assert_eq!(env.net_send(UTEXT, 16), Err(RtError::Killed));
    assert_eq!(env.status(), None);
}

#[test]
fn exec_adopts_prepared_image() {
    let machine = boot(128);
    let env = machine.spawn().unwrap();
    let image = env.exofork().unwrap();

    // Stage one page of the new image through our own address space.
    env.page_alloc(EnvId::SELF, UTEXT, Perm::PUW).unwrap();
    env.write_u32(UTEXT, 0x600d).unwrap();
    env.page_map(EnvId::SELF, UTEXT, image, UTEXT, Perm::PU).unwrap();
    env.page_unmap(EnvId::SELF, UTEXT).unwrap();
    env.page_alloc(EnvId::SELF, UTEXT + PAGE_SIZE, Perm::PUW).unwrap();

    env.exec(image).unwrap();
    assert_eq!(env.read_u32(UTEXT).unwrap(), 0x600d);
    assert_eq!(env.uvpt(UTEXT).unwrap().perm, Perm::PU);
    assert!(env.uvpt(UTEXT + PAGE_SIZE).is_none());
    assert!(machine.handle(image).status().is_none());
    assert_eq!(env.getenvid().unwrap(), env.id());
}
