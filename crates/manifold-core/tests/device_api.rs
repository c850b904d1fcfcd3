//! Integration coverage of the public dispatch surface, driven through the
//! CPU backend (the one backend every machine has).

use manifold_core::{
    args, Access, Attribute, AttributeKind, BinaryCache, CpuDevice, DataType, DeviceAttributeId,
    DeviceFingerprint, Error, ImageDescription, LaunchArgs, PixelOrder, Size3, Stride2,
};

fn setup() -> manifold_core::Device {
    manifold_tracing::init_for_tests();
    CpuDevice::create().expect("CPU device")
}

#[test]
fn device_identifies_itself() {
    let device = setup();
    assert_eq!(
        device.get_attribute(DeviceAttributeId::Implementation).as_str(),
        "CPU"
    );
    assert!(CpuDevice::is_available());

    // unknown-for-backend attributes come back invalid, not as errors
    let driver = device.get_attribute(DeviceAttributeId::DriverVersion);
    assert_eq!(driver.kind(), AttributeKind::String);
}

#[test]
fn buffers_round_trip_through_streams() {
    let device = setup();
    let stream = device.create_stream().expect("stream");

    let a = device.allocate_buffer(256, Access::ReadWrite).expect("buffer");
    let b = device.allocate_buffer(256, Access::ReadWrite).expect("buffer");

    let payload: Vec<u8> = (0..=255).collect();
    a.copy_from_host(&stream, &payload).unwrap();
    b.copy_from(&stream, &a, 256).unwrap();

    let mut out = vec![0u8; 256];
    b.copy_to_host(&stream, &mut out).unwrap();
    stream.sync().unwrap();
    assert_eq!(out, payload);
}

#[test]
fn stream_order_is_fifo() {
    let device = setup();
    let stream = device.default_stream();
    let buffer = device.allocate_buffer(4, Access::ReadWrite).unwrap();

    // later writes must win after a sync
    buffer.copy_from_host(&stream, &[1, 1, 1, 1]).unwrap();
    buffer.copy_from_host(&stream, &[2, 2, 2, 2]).unwrap();

    let mut out = [0u8; 4];
    buffer.copy_to_host(&stream, &mut out).unwrap();
    stream.sync().unwrap();
    assert_eq!(out, [2, 2, 2, 2]);
}

#[test]
fn host_memory_is_zeroed_and_sized() {
    let device = setup();
    let mem = device.allocate_host_memory(128);
    assert_eq!(mem.len(), 128);
    let view = unsafe { std::slice::from_raw_parts(mem.as_ptr(), mem.len()) };
    assert!(view.iter().all(|&b| b == 0));
}

#[test]
fn launch_args_arithmetic() {
    let launch = LaunchArgs::new().global(32).local(1);
    assert_eq!(launch.count(), 32);

    let launch = LaunchArgs::new().global_2d(33, 7).local_2d(8, 2);
    assert_eq!(launch.count_dim(0), 5);
    assert_eq!(launch.count_dim(1), 4);
    assert_eq!(launch.count(), 20);
}

#[test]
fn attribute_list_building() {
    let device = setup();
    let buffer = device.allocate_buffer(64, Access::ReadWrite).unwrap();

    let list = args![&buffer, 3i32, [1.0f32, 2.0], Attribute::local_mem(64)];
    assert_eq!(list.len(), 4);
    assert_eq!(list[0].kind(), AttributeKind::Buffer);
    assert!(list[0].as_buffer().is_some());
    assert_eq!(list[1].as_i32(), 3);
    assert_eq!(list[2].count(), 2);
    assert_eq!(list[3].local_mem_bytes(), 64);
}

#[test]
fn images_carry_descriptors() {
    let device = setup();
    let descr = ImageDescription::new(
        Size3::new(16, 16, 1),
        4,
        PixelOrder::Rgba,
        DataType::UInt8,
        Stride2::new(64, 1024),
    )
    .with_access(Access::ReadOnly);

    let image = device.allocate_image(&descr).unwrap();
    assert_eq!(image.description(), descr);
    assert_eq!(image.description().pixel_size(), 4);

    let buffer = device.allocate_buffer(1024, Access::ReadWrite).unwrap();
    let aliased = device.shared_image_from_buffer(&descr, &buffer).unwrap();
    assert_eq!(aliased.description(), descr);
}

#[test]
fn unsupported_operations_surface_cleanly() {
    let device = setup();
    assert!(matches!(
        device.load_library_from_text("__kernel void k() {}", "-O2"),
        Err(Error::Unsupported(_))
    ));
    assert!(matches!(
        device.allocate_mapped_buffer(16, Access::ReadWrite),
        Err(Error::Unsupported(_))
    ));
}

#[test]
fn binary_cache_is_shared_and_injectable() {
    let device = setup();
    let cache = device.binary_cache();
    // devices default to the process-wide instance
    assert!(std::sync::Arc::ptr_eq(&cache, &BinaryCache::global()));
}

#[test]
fn binary_cache_round_trip_via_public_api() {
    let _device = setup();
    let dir = tempfile::tempdir().unwrap();
    let cache = BinaryCache::new();
    cache.set_path(dir.path());

    let fingerprint = DeviceFingerprint {
        vendor: "X".into(),
        name: "Y".into(),
        driver_version: "Z".into(),
        units: 2,
    };
    cache.save(&fingerprint, &[&[0x01, 0x02], &[0x03]], b"code", "-O2");

    assert_eq!(
        cache.load(&fingerprint, b"code", "-O2"),
        Some(vec![vec![0x01, 0x02], vec![0x03]])
    );
    assert_eq!(cache.load(&fingerprint, b"code", "-O1"), None);
}

#[test]
fn purge_binaries_is_best_effort() {
    let device = setup();
    // no cache directory configured: must be a no-op, not an error
    device.purge_binaries(30);
}

#[test]
fn share_context_round_trips_null_handles() {
    let device = setup();
    let share = device.share_context();
    assert!(share.context.is_null());
    assert!(share.queue.is_null());

    // the CPU backend accepts any shared context and ignores it
    let second = CpuDevice::create_with_context(&share).unwrap();
    assert_eq!(
        second.get_attribute(DeviceAttributeId::Implementation).as_str(),
        "CPU"
    );
}

#[test]
fn memory_pool_size_round_trips() {
    let device = setup();
    device.set_memory_pool_size(4096);
    assert_eq!(device.memory_pool_size(), 4096);
}
