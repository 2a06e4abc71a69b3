mod common;

use std::{
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

use deckcore::{
    config::{DeckConfig, RuntimeImage},
    management::{DirAssetSource, HttpDownloadClient, RuntimeInstaller, RuntimeLayout},
    DeckEngine, DeckcoreError,
};
use tempfile::tempdir;

use common::{fast_bootstrap_policy, fast_launch_policy, ScriptChain, GUEST_SLEEP, WINEBOOT_OK};

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_install_and_reinstall_preserves_user_data() -> anyhow::Result<()> {
    let home = tempdir()?;
    let assets = tempdir()?;
    write_assets(assets.path())?;

    let layout = RuntimeLayout::new(home.path());
    let first = installer(&layout, assets.path(), 1);
    assert!(!first.is_available().await);

    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    first
        .install(Arc::new(move |fraction: f32, _: &str| {
            sink.lock().unwrap().push(fraction);
        }))
        .await?;

    assert!(first.is_available().await);
    assert!(layout.box64_binary().is_file());
    assert!(layout.proot_binary().is_file());
    assert!(layout.rootfs_dir().join("opt/wine/bin/wine64").is_file());
    assert!(layout.containers_dir().is_dir());
    assert!(layout.shm_dir().is_dir());

    let reports = reports.lock().unwrap().clone();
    assert!(reports.windows(2).all(|w| w[0] <= w[1] + 1e-5));
    assert_eq!(reports.last().copied(), Some(1.0));

    // User data survives an image upgrade; stale image files do not.
    let save = layout.rootfs_dir().join("home/xuser/save.dat");
    std::fs::create_dir_all(save.parent().unwrap())?;
    std::fs::write(&save, "progress")?;
    let stale = layout.rootfs_dir().join("etc/stale.conf");
    std::fs::create_dir_all(stale.parent().unwrap())?;
    std::fs::write(&stale, "old")?;

    installer(&layout, assets.path(), 2)
        .install(Arc::new(|_: f32, _: &str| {}))
        .await?;

    assert_eq!(std::fs::read_to_string(&save)?, "progress");
    assert!(!stale.exists());
    assert!(layout.rootfs_dir().join("opt/wine/bin/wine64").is_file());
    assert_eq!(
        std::fs::read_to_string(layout.image_version_file())?.trim(),
        "2"
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_install_missing_asset() -> anyhow::Result<()> {
    let home = tempdir()?;
    let assets = tempdir()?;

    let layout = RuntimeLayout::new(home.path());
    let result = installer(&layout, assets.path(), 1)
        .install(Arc::new(|_: f32, _: &str| {}))
        .await;

    assert!(matches!(result, Err(DeckcoreError::ExtractionFailure(_))));
    assert!(!layout.image_version_file().exists());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_engine_end_to_end() -> anyhow::Result<()> {
    let home = tempdir()?;
    let assets = tempdir()?;
    write_assets(assets.path())?;

    let config = DeckConfig::builder()
        .home(home.path())
        .runtime(image(1))
        .bootstrap(fast_bootstrap_policy())
        .launch(fast_launch_policy())
        .mono_url(None)
        .build();
    let engine = DeckEngine::with_parts(
        config,
        Arc::new(DirAssetSource::new(assets.path())),
        Arc::new(ScriptChain::new(WINEBOOT_OK, GUEST_SLEEP)),
        Arc::new(HttpDownloadClient::new()),
    );

    engine.initialize(Arc::new(|_: f32, _: &str| {})).await?;
    assert!(engine.is_available().await);

    let container = engine.default_container().await?;
    let again = engine.default_container().await?;
    assert!(Arc::ptr_eq(&container, &again));

    // The compatibility layer gets a `wine` alias once a container exists.
    let wine = home.path().join("rootfs/opt/wine/bin/wine");
    assert!(std::fs::symlink_metadata(&wine)?.file_type().is_symlink());

    let exe = container.drive_c().join("game.exe");
    std::fs::write(&exe, "MZ")?;
    let process = engine.launch_executable(&container, &exe, &[]).await?;
    assert!(engine.get_process_status(process.get_id()).await?.is_running());
    engine.kill_process(process.get_id(), true).await?;

    let listed = engine.list_containers().await?;
    assert_eq!(listed.len(), 1);
    assert!(listed[0].get_last_used_at().is_some());

    engine.delete_container(container.get_id()).await?;
    assert!(engine.list_containers().await?.is_empty());
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn image(version: u32) -> RuntimeImage {
    RuntimeImage::builder()
        .image_version(version)
        .box64_version("0.3.2")
        .interpreter("/system/bin/linker64")
        .rootfs_asset("rootfs.txz")
        .proot_asset("proot.tzst")
        .build()
}

fn installer(layout: &RuntimeLayout, assets: &Path, version: u32) -> RuntimeInstaller {
    RuntimeInstaller::new(
        layout.clone(),
        image(version),
        Arc::new(DirAssetSource::new(assets)),
    )
}

fn write_assets(dir: &Path) -> anyhow::Result<()> {
    let rootfs = tar_bytes(&[
        ("opt/wine/bin/wine64", b"#!/bin/sh\n".as_slice(), 0o755),
        ("etc/hosts", b"127.0.0.1 localhost\n".as_slice(), 0o644),
    ])?;
    let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
    encoder.write_all(&rootfs)?;
    std::fs::write(dir.join("rootfs.txz"), encoder.finish()?)?;

    let elf = minimal_elf();
    let box64 = tar_bytes(&[("box64", elf.as_slice(), 0o755)])?;
    std::fs::write(
        dir.join("box64-0.3.2.tzst"),
        zstd::stream::encode_all(&box64[..], 0)?,
    )?;

    let proot = tar_bytes(&[("proot", b"#!/bin/sh\n".as_slice(), 0o755)])?;
    std::fs::write(
        dir.join("proot.tzst"),
        zstd::stream::encode_all(&proot[..], 0)?,
    )?;
    Ok(())
}

fn tar_bytes(entries: &[(&str, &[u8], u32)]) -> anyhow::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data, mode) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(*mode);
        builder.append_data(&mut header, path, *data)?;
    }
    Ok(builder.into_inner()?)
}

/// A little-endian ELF64 shared object with a single `PT_LOAD` segment.
fn minimal_elf() -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    bytes.extend_from_slice(&[0; 8]);
    bytes.extend_from_slice(&3u16.to_le_bytes()); // ET_DYN
    bytes.extend_from_slice(&0xb7u16.to_le_bytes()); // EM_AARCH64
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&0x1000u64.to_le_bytes());
    bytes.extend_from_slice(&64u64.to_le_bytes());
    bytes.extend_from_slice(&0u64.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&64u16.to_le_bytes());
    bytes.extend_from_slice(&56u16.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&64u16.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());

    bytes.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    bytes.extend_from_slice(&5u32.to_le_bytes());
    for _ in 0..5 {
        bytes.extend_from_slice(&0u64.to_le_bytes());
    }
    bytes.extend_from_slice(&0x1000u64.to_le_bytes());
    bytes
}
