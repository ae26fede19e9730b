//! Inventory reconciliation over a fake sysfs tree.

mod common;

use common::*;
use pcidev_core::types::UNKNOWN_IOMMU_GROUP;
use pcidev_core::{DeviceStore, LabelSelector};

const BRIDGE: &str = "0000:00:01.0";
const MGMT_NIC: &str = "0000:03:00.0";

/// Bridge, management NIC behind `mgmt-bo`, and a GPU in IOMMU group 27.
fn mixed_host() -> FakeHost {
    let host = FakeHost::with_gpu();
    host.add_function(BRIDGE, "8086", "1901", "060400", Some("pcieport"));
    host.add_function(MGMT_NIC, "8086", "1572", "020000", Some("i40e"));
    host.add_nic("eth0", Some(MGMT_NIC), Some("mgmt-bo"), "up");
    host
}

#[tokio::test]
async fn test_only_assignable_devices_recorded() {
    let h = Harness::new(mixed_host()).await;

    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.discovered, 3);
    assert_eq!(report.excluded, 2);
    assert_eq!(report.created, 1);

    let devices = h.store.list_devices(&LabelSelector::node(NODE)).await.unwrap();
    assert_eq!(devices.len(), 1);

    let gpu = &devices[0];
    assert_eq!(gpu.name, GPU_RECORD);
    assert_eq!(gpu.status.address, GPU);
    assert_eq!(gpu.status.vendor_id, "10de");
    assert_eq!(gpu.status.device_id, "2204");
    assert_eq!(gpu.status.class_id, "03");
    assert_eq!(gpu.status.iommu_group, 27);
    assert_eq!(gpu.status.kernel_driver_in_use.as_deref(), Some("nvidia"));
    assert_eq!(gpu.status.resource_name, GPU_CLASS);
    assert_eq!(gpu.labels.get("nodename").map(String::as_str), Some(NODE));
}

#[tokio::test]
async fn test_driver_change_updates_record() {
    let h = Harness::new(mixed_host()).await;
    h.reconciler.reconcile_once().await.unwrap();

    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.updated, 0);

    h.host.bind(GPU, "vfio-pci");
    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.updated, 1);

    let gpu = h.store.get_device(GPU_RECORD).await.unwrap();
    assert_eq!(gpu.status.kernel_driver_in_use.as_deref(), Some("vfio-pci"));
}

#[tokio::test]
async fn test_removed_function_pruned() {
    let host = mixed_host();
    host.add_function("0000:41:00.0", "10de", "2204", "030000", None);
    let h = Harness::new(host).await;
    h.reconciler.reconcile_once().await.unwrap();

    let lost = h.store.get_device("node1-000041000").await.unwrap();
    assert_eq!(lost.status.iommu_group, UNKNOWN_IOMMU_GROUP);
    assert_eq!(lost.status.kernel_driver_in_use, None);

    std::fs::remove_dir_all(h.host.root().join("bus/pci/devices/0000:41:00.0")).unwrap();
    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.pruned, 1);
    assert!(h.store.get_device("node1-000041000").await.unwrap_err().is_not_found());
    assert!(h.store.get_device(GPU_RECORD).await.is_ok());
}

#[tokio::test]
async fn test_records_of_other_nodes_untouched() {
    let h = Harness::new(mixed_host()).await;

    let function = pcidev_core::PciFunction {
        address: "0000:05:00.0".into(),
        vendor_id: "1002".into(),
        device_id: "73bf".into(),
        class_id: "03".into(),
        subclass_id: "00".into(),
        driver: None,
    };
    let other = pcidev_core::PciDevice::for_node(&function, "node2", 3);
    h.store.create_device(&other).await.unwrap();

    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.pruned, 0);
    assert!(h.store.get_device("node2-000005000").await.is_ok());

    let all = h.store.list_devices(&LabelSelector::everything()).await.unwrap();
    assert_eq!(all.len(), 2);
}
