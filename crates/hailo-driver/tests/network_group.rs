//! Integration tests for network-group configuration and activation
//!
//! Firmware-visible behavior is checked through the software driver's
//! event log.

use hailo_chip::context::ContextKind;
use hailo_chip::control::{opcode, switch_status};
use hailo_chip::descriptor::DmaType;
use hailo_chip::vdma::Direction;
use hailo_driver::action_list::decode_action_list;
use hailo_driver::drivers::DeviceEvent;
use hailo_driver::metadata::{ConfigChannelInfo, ContextMetadata, LayerInfo};
use hailo_driver::prelude::*;
use hailo_driver::resources::ChannelType;
use hailo_driver::{DeviceProperties, SoftwareDriver};
use std::sync::Arc;

fn group(name: &str) -> Arc<NetworkGroupMetadata> {
    let net = format!("{name}/net");
    Arc::new(NetworkGroupMetadata {
        network_group_name: name.into(),
        network_names: vec![net.clone()],
        dynamic_contexts: vec![ContextMetadata {
            layers: vec![
                LayerInfo::boundary(&format!("{name}/in"), &net, Direction::H2D, 0, 512),
                LayerInfo::boundary(&format!("{name}/out"), &net, Direction::D2H, 1, 512),
            ],
            ..ContextMetadata::default()
        }],
        ..NetworkGroupMetadata::default()
    })
}

fn device_with(driver: &Arc<SoftwareDriver>) -> Arc<VdmaDevice> {
    Arc::new(VdmaDevice::from_driver(driver.clone(), "sim0"))
}

fn headers_sent(driver: &SoftwareDriver) -> usize {
    driver
        .events()
        .iter()
        .filter(|e| **e == DeviceEvent::Control { opcode: opcode::SET_NETWORK_GROUP_HEADER })
        .count()
}

/// Deactivation aborts, resets the state machine, then stops the channels
#[test]
fn test_teardown_order() {
    let driver = Arc::new(SoftwareDriver::new());
    let mut manager = build(device_with(&driver), ConfigureParams::default(), group("g"), 0).unwrap();
    let input = manager.input_stream("g/in").unwrap();
    let output = manager.output_stream("g/out").unwrap();
    let (in_id, out_id) = (input.channel_id(), output.channel_id());

    let active = manager.activate(&[input.clone()], &[output.clone()], 0).unwrap();
    assert!(driver.events().contains(&DeviceEvent::ContextSwitchStatus(switch_status::ENABLED)));
    assert_eq!(driver.enabled_channels(), [in_id, out_id]);

    driver.clear_events();
    active.deactivate(false).expect("Deactivation failed");

    assert_eq!(
        driver.events(),
        [
            DeviceEvent::ChannelAborted(in_id),
            DeviceEvent::ChannelAborted(out_id),
            DeviceEvent::Control {
                opcode: opcode::CHANGE_CONTEXT_SWITCH_STATUS
            },
            DeviceEvent::ContextSwitchStatus(switch_status::RESET),
            DeviceEvent::ChannelDisabled(in_id),
            DeviceEvent::ChannelDisabled(out_id),
        ]
    );
    assert!(driver.enabled_channels().is_empty());
    assert!(!input.is_aborted());
    assert!(!output.is_aborted());
}

/// DRAM-DMA devices reset the nn core unless asked to keep its config
#[test]
fn test_nn_core_reset_on_dram() {
    let properties = DeviceProperties {
        dma_type: DmaType::Dram,
        ..DeviceProperties::default()
    };
    let driver = Arc::new(SoftwareDriver::with_properties(properties));
    let mut manager = build(device_with(&driver), ConfigureParams::default(), group("g"), 0).unwrap();
    let input = manager.input_stream("g/in").unwrap();
    let output = manager.output_stream("g/out").unwrap();

    let active = manager.activate(&[input.clone()], &[output.clone()], 0).unwrap();
    driver.clear_events();
    active.deactivate(true).unwrap();
    assert!(!driver.events().contains(&DeviceEvent::NnCoreReset));

    let active = manager.activate(&[input.clone()], &[output.clone()], 0).unwrap();
    driver.clear_events();
    drop(active);
    let events = driver.events();
    let reset = events
        .iter()
        .position(|e| *e == DeviceEvent::ContextSwitchStatus(switch_status::RESET))
        .expect("No state machine reset");
    assert_eq!(events[reset + 1], DeviceEvent::NnCoreReset);
}

/// Activation requires a configured group
#[test]
fn test_activate_before_configure() {
    let driver = Arc::new(SoftwareDriver::new());
    let mut manager = ResourcesManager::create(device_with(&driver), ConfigureParams::default(), group("g"), 0).unwrap();
    assert!(matches!(
        manager.activate(&[], &[], 0),
        Err(VdmaError::InvalidOperation { .. })
    ));
}

/// Firmware hands back exactly the program the host built
#[test]
fn test_download_matches_built_program() {
    let driver = Arc::new(SoftwareDriver::new());
    let mut manager = build(device_with(&driver), ConfigureParams::default(), group("g"), 0).unwrap();

    let downloaded = manager
        .download_context_action_list(ContextKind::Dynamic, 0)
        .expect("Download failed");
    let built = manager.contexts()[1].action_list();
    assert_eq!(downloaded.data.as_ref(), built.as_slice());
    assert_eq!(downloaded.batch_counter, 0);

    let records = decode_action_list(&downloaded.data, downloaded.data.len()).expect("Bad action list");
    assert!(!records.is_empty());

    let input = manager.input_stream("g/in").unwrap();
    let output = manager.output_stream("g/out").unwrap();
    let active = manager.activate(&[input], &[output], 0).unwrap();
    let after = active
        .resources()
        .download_context_action_list(ContextKind::Dynamic, 0)
        .unwrap();
    assert_eq!(after.batch_counter, 1);

    assert!(active
        .resources()
        .download_context_action_list(ContextKind::Dynamic, 1)
        .is_err());
}

/// A corrupted response is rejected; the next request succeeds
#[test]
fn test_response_digest_mismatch() {
    let driver = Arc::new(SoftwareDriver::new());
    let device = device_with(&driver);
    driver.corrupt_next_response_digest();
    assert!(matches!(device.identify(), Err(VdmaError::DigestMismatch)));
    device.identify().expect("Identify after mismatch failed");
}

/// Each engine holds 16 channels per direction
#[test]
fn test_channel_exhaustion() {
    let driver = Arc::new(SoftwareDriver::new());
    let mut manager = ResourcesManager::create(device_with(&driver), ConfigureParams::default(), group("g"), 0).unwrap();

    for direction in [Direction::H2D, Direction::D2H] {
        for _ in 0..16 {
            manager
                .get_available_channel_index(&[], ChannelType::Boundary, direction, 0, None)
                .expect("Channel should be available");
        }
    }
    assert_eq!(manager.channel_table().assigned().count(), 32);
    assert!(matches!(
        manager.get_available_channel_index(&[], ChannelType::Boundary, Direction::H2D, 0, None),
        Err(VdmaError::ResourceExhausted { available: 0, .. })
    ));
}

/// Group with `inputs` H2D and `outputs` D2H boundary layers in one context
fn wide_group(inputs: u8, outputs: u8, config_channels: usize) -> Arc<NetworkGroupMetadata> {
    let layers = (0..inputs)
        .map(|i| LayerInfo::boundary(&format!("w/in{i}"), "w/net", Direction::H2D, i, 512))
        .chain((0..outputs).map(|i| LayerInfo::boundary(&format!("w/out{i}"), "w/net", Direction::D2H, inputs + i, 512)))
        .collect();
    Arc::new(NetworkGroupMetadata {
        network_group_name: "w".into(),
        network_names: vec!["w/net".into()],
        config_channels: vec![ConfigChannelInfo::default(); config_channels],
        dynamic_contexts: vec![ContextMetadata {
            layers,
            ..ContextMetadata::default()
        }],
        ..NetworkGroupMetadata::default()
    })
}

/// A group using every channel of the engine builds
#[test]
fn test_build_with_all_channels() {
    let driver = Arc::new(SoftwareDriver::new());
    let manager = build(device_with(&driver), ConfigureParams::default(), wide_group(16, 16, 0), 0)
        .expect("32 channels should fit one engine");
    assert_eq!(manager.channel_table().assigned().count(), 32);
    assert_eq!(manager.input_stream("w/in15").unwrap().channel_id().channel_index, 15);
    assert_eq!(manager.output_stream("w/out15").unwrap().channel_id().channel_index, 31);
    assert!(manager.is_configured());
}

/// One channel too many fails the whole build before anything reaches firmware
#[test]
fn test_build_one_channel_too_many() {
    let driver = Arc::new(SoftwareDriver::new());
    // The cfg channel takes H2D 0, leaving 15 for 16 inputs
    let result = build(device_with(&driver), ConfigureParams::default(), wide_group(16, 16, 1), 0);
    assert!(
        matches!(result, Err(VdmaError::ResourceExhausted { available: 0, .. })),
        "got {result:?}"
    );
    assert_eq!(headers_sent(&driver), 0);
    assert!(driver.enabled_channels().is_empty());
}

/// Blacklisted channels are skipped
#[test]
fn test_channel_blacklist() {
    let driver = Arc::new(SoftwareDriver::new());
    let mut manager = ResourcesManager::create(device_with(&driver), ConfigureParams::default(), group("g"), 0).unwrap();
    let id = manager
        .get_available_channel_index(&[0, 1], ChannelType::InterContext, Direction::H2D, 0, None)
        .unwrap();
    assert_eq!(id.channel_index, 2);
}

/// Configuring the same group twice through a registry shares one instance
#[test]
fn test_registry_shares_configured_groups() {
    let driver = Arc::new(SoftwareDriver::new());
    let device = device_with(&driver);
    let registry = ConfiguredNetworkGroups::new();
    let configure = |name: &str| registry.configure(&device, ConfigureParams::default(), group(name), 0);

    let first = configure("a").unwrap();
    assert_eq!(headers_sent(&driver), 1);

    let again = configure("a").unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(headers_sent(&driver), 1);

    let other = configure("b").unwrap();
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(registry.len(), 2);

    // A different batch size is a different group
    let params = ConfigureParams::default().with_network("a/net", NetworkParams::default().with_batch_size(4));
    let batched = registry.configure(&device, params, group("a"), 0).unwrap();
    assert!(!Arc::ptr_eq(&first, &batched));
    assert_eq!(registry.len(), 3);
}

/// A group shared through the registry can be activated and torn down by
/// whichever holder locks it, and activated again afterwards
#[test]
fn test_registry_group_activates() {
    let driver = Arc::new(SoftwareDriver::new());
    let device = device_with(&driver);
    let registry = ConfiguredNetworkGroups::new();

    let shared = registry.configure(&device, ConfigureParams::default(), group("g"), 0).unwrap();
    {
        let mut manager = shared.lock();
        let input = manager.input_stream("g/in").unwrap();
        let output = manager.output_stream("g/out").unwrap();
        let active = manager.activate(&[input.clone()], &[output.clone()], 0).expect("Failed to activate");
        assert!(driver.events().contains(&DeviceEvent::ContextSwitchStatus(switch_status::ENABLED)));

        input.write(&[5; 512]).unwrap();
        let mut received = [0u8; 512];
        output.read(&mut received).unwrap();
        assert_eq!(received, [5; 512]);

        driver.clear_events();
        active.deactivate(false).expect("Deactivation failed");
        assert!(driver.events().contains(&DeviceEvent::ContextSwitchStatus(switch_status::RESET)));
        assert!(driver.enabled_channels().is_empty());
    }

    let again = registry.configure(&device, ConfigureParams::default(), group("g"), 0).unwrap();
    assert!(Arc::ptr_eq(&shared, &again));
    let mut manager = again.lock();
    let input = manager.input_stream("g/in").unwrap();
    let output = manager.output_stream("g/out").unwrap();
    let active = manager.activate(&[input], &[output], 0).expect("Failed to reactivate");
    assert_eq!(driver.enabled_channels().len(), 2);
    drop(active);
    assert!(driver.enabled_channels().is_empty());
}

/// Configuring through the kernel driver on a real device
#[test]
#[ignore] // Requires hardware
fn test_hardware_configure() {
    let device = Arc::new(VdmaDevice::open("/dev/hailo0").expect("Failed to open /dev/hailo0"));
    let manager = build(device, ConfigureParams::default(), group("hw"), 0).expect("Configure failed");
    assert!(manager.is_configured());
}
