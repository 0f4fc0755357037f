//! In-memory collaborators for controller tests
//!
//! [`fixture`] builds a plan `mtv/plan` that migrates vSphere VM `vm-1`
//! ("web") into `migrated-vms`, with both providers ready, both maps
//! covering the VM, and fakes standing in for the cluster, the inventory,
//! the source platform and the populator runtime. Every fake keeps its
//! state behind a lock so tests can inspect and steer it between ticks.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use forklift_adapter::{
    AdapterError, Capabilities, DiskChanges, DiskHandle, DiskSourceKind, Extent, Inspection,
    SnapshotState, SourceAdapter,
};
use forklift_common::conditions::{READY, REASON_VALIDATED};
use forklift_common::crd::{
    Category, Condition, DestinationNetwork, DestinationStorage, Hook, HookSpec, Migration,
    MigrationSpec, MigrationStatus, NetworkMap, NetworkMapSpec, NetworkPair, NetworkType,
    ObjectRef, Plan, PlanMaps, PlanSpec, PlanStatus, PlanVm, PowerState, Provider, ProviderPair,
    ProviderPhase, ProviderSpec, ProviderStatus, ProviderType, Ref, StorageMap, StorageMapSpec,
    StoragePair, VmStatus,
};
use forklift_common::events::EventPublisher;
use forklift_common::settings::Settings;
use forklift_common::PLAN_FINALIZER;
use forklift_inventory::{
    Disk, Inventory, InventoryError, Network, Nic, ProviderInfo, ProviderKey, Storage, Vm,
};
use forklift_populator::{
    Coordinator, PopulatorError, Worker, WorkerPhase, WorkerRuntime, WorkerSpec,
};
use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::ByteString;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use parking_lot::Mutex;

use crate::client::KubeClient;
use crate::controller::{reconcile_at, Context};
use crate::error::PlanError;
use crate::source::SourceFactory;
use crate::target::{JobState, ObjectKind, PodState, TargetCluster, TargetObject};

/// Namespace of the plan and everything it references
pub(crate) const NS: &str = "mtv";
/// Target namespace of the plan
pub(crate) const TARGET_NS: &str = "migrated-vms";
/// Reconciles per [`Fixture::settle`]
const SETTLE_TICKS: usize = 16;

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn named<K: kube::Resource>(mut object: K, namespace: &str) -> K {
    object.meta_mut().namespace = Some(namespace.to_string());
    object.meta_mut().generation = Some(1);
    object
}

// =============================================================================
// Kubernetes API
// =============================================================================

struct KubeState {
    plan: Plan,
    providers: BTreeMap<String, Provider>,
    secrets: BTreeMap<String, Secret>,
    network_maps: BTreeMap<String, NetworkMap>,
    storage_maps: BTreeMap<String, StorageMap>,
    hooks: BTreeMap<String, Hook>,
    attachments: BTreeSet<String>,
    migrations: Vec<Migration>,
}

impl Default for KubeState {
    fn default() -> Self {
        Self {
            plan: Plan::new("plan", PlanSpec::default()),
            providers: BTreeMap::new(),
            secrets: BTreeMap::new(),
            network_maps: BTreeMap::new(),
            storage_maps: BTreeMap::new(),
            hooks: BTreeMap::new(),
            attachments: BTreeSet::new(),
            migrations: Vec::new(),
        }
    }
}

/// Plan-side API objects kept in memory; status patches replace status
#[derive(Default)]
pub(crate) struct FakeKube {
    state: Mutex<KubeState>,
}

impl FakeKube {
    pub fn plan(&self) -> Plan {
        self.state.lock().plan.clone()
    }

    pub fn edit_plan(&self, edit: impl FnOnce(&mut Plan)) {
        edit(&mut self.state.lock().plan);
    }

    pub fn put_provider(&self, provider: Provider) {
        let k = key(&provider.namespace().unwrap_or_default(), &provider.name_any());
        self.state.lock().providers.insert(k, provider);
    }

    pub fn edit_provider(&self, name: &str, edit: impl FnOnce(&mut Provider)) {
        if let Some(p) = self.state.lock().providers.get_mut(&key(NS, name)) {
            edit(p);
        }
    }

    pub fn put_secret(&self, secret: Secret) {
        let k = key(&secret.namespace().unwrap_or_default(), &secret.name_any());
        self.state.lock().secrets.insert(k, secret);
    }

    pub fn put_network_map(&self, map: NetworkMap) {
        let k = key(&map.namespace().unwrap_or_default(), &map.name_any());
        self.state.lock().network_maps.insert(k, map);
    }

    pub fn put_storage_map(&self, map: StorageMap) {
        let k = key(&map.namespace().unwrap_or_default(), &map.name_any());
        self.state.lock().storage_maps.insert(k, map);
    }

    pub fn put_hook(&self, hook: Hook) {
        let k = key(&hook.namespace().unwrap_or_default(), &hook.name_any());
        self.state.lock().hooks.insert(k, hook);
    }

    pub fn put_attachment(&self, namespace: &str, name: &str) {
        self.state.lock().attachments.insert(key(namespace, name));
    }

    pub fn add_migration(&self, migration: Migration) {
        self.state.lock().migrations.push(migration);
    }

    pub fn migration(&self, name: &str) -> Option<Migration> {
        self.state
            .lock()
            .migrations
            .iter()
            .find(|m| m.name_any() == name)
            .cloned()
    }

    pub fn edit_migration(&self, name: &str, edit: impl FnOnce(&mut Migration)) {
        if let Some(m) = self
            .state
            .lock()
            .migrations
            .iter_mut()
            .find(|m| m.name_any() == name)
        {
            edit(m);
        }
    }
}

#[async_trait]
impl KubeClient for FakeKube {
    async fn get_provider(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Provider>, PlanError> {
        Ok(self.state.lock().providers.get(&key(namespace, name)).cloned())
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, PlanError> {
        Ok(self.state.lock().secrets.get(&key(namespace, name)).cloned())
    }

    async fn get_network_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<NetworkMap>, PlanError> {
        Ok(self.state.lock().network_maps.get(&key(namespace, name)).cloned())
    }

    async fn get_storage_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<StorageMap>, PlanError> {
        Ok(self.state.lock().storage_maps.get(&key(namespace, name)).cloned())
    }

    async fn get_hook(&self, name: &str, namespace: &str) -> Result<Option<Hook>, PlanError> {
        Ok(self.state.lock().hooks.get(&key(namespace, name)).cloned())
    }

    async fn network_attachment_exists(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<bool, PlanError> {
        Ok(self.state.lock().attachments.contains(&key(namespace, name)))
    }

    async fn list_migrations(
        &self,
        plan: &str,
        namespace: &str,
    ) -> Result<Vec<Migration>, PlanError> {
        Ok(self
            .state
            .lock()
            .migrations
            .iter()
            .filter(|m| m.spec.plan.name == plan && m.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect())
    }

    async fn patch_plan_status(
        &self,
        name: &str,
        _namespace: &str,
        status: &PlanStatus,
    ) -> Result<(), PlanError> {
        let mut state = self.state.lock();
        if state.plan.name_any() == name {
            state.plan.status = Some(status.clone());
        }
        Ok(())
    }

    async fn patch_migration_status(
        &self,
        name: &str,
        _namespace: &str,
        status: &MigrationStatus,
    ) -> Result<(), PlanError> {
        if let Some(m) = self
            .state
            .lock()
            .migrations
            .iter_mut()
            .find(|m| m.name_any() == name)
        {
            m.status = Some(status.clone());
        }
        Ok(())
    }

    async fn add_finalizer(&self, _name: &str, _namespace: &str) -> Result<(), PlanError> {
        let mut state = self.state.lock();
        let finalizers = state.plan.metadata.finalizers.get_or_insert_with(Vec::new);
        if !finalizers.iter().any(|f| f == PLAN_FINALIZER) {
            finalizers.push(PLAN_FINALIZER.to_string());
        }
        Ok(())
    }

    async fn remove_finalizer(&self, _name: &str, _namespace: &str) -> Result<(), PlanError> {
        if let Some(finalizers) = self.state.lock().plan.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != PLAN_FINALIZER);
        }
        Ok(())
    }
}

// =============================================================================
// Inventory
// =============================================================================

/// Inventory serving a fixed VM list
#[derive(Default)]
pub(crate) struct FakeInventory {
    vms: Mutex<Vec<Vm>>,
    failure: Mutex<Option<InventoryError>>,
}

impl FakeInventory {
    pub fn put_vm(&self, vm: Vm) {
        self.vms.lock().push(vm);
    }

    /// Make every VM lookup fail with `error`
    pub fn fail_with(&self, error: InventoryError) {
        *self.failure.lock() = Some(error);
    }
}

#[async_trait]
impl Inventory for FakeInventory {
    async fn provider(&self, provider: &ProviderKey) -> Result<ProviderInfo, InventoryError> {
        Ok(ProviderInfo {
            uid: provider.uid.clone(),
            name: "vsphere".into(),
            status: "Ready".into(),
            vm_count: self.vms.lock().len() as u64,
        })
    }

    async fn vms(&self, _provider: &ProviderKey) -> Result<Vec<Vm>, InventoryError> {
        if let Some(e) = self.failure.lock().clone() {
            return Err(e);
        }
        Ok(self.vms.lock().clone())
    }

    async fn vm(&self, _provider: &ProviderKey, reference: &Ref) -> Result<Vm, InventoryError> {
        if let Some(e) = self.failure.lock().clone() {
            return Err(e);
        }
        self.vms
            .lock()
            .iter()
            .find(|vm| reference.matches(&vm.reference()))
            .cloned()
            .ok_or_else(|| InventoryError::NotFound {
                kind: "vm",
                reference: reference.to_string(),
            })
    }

    async fn network(
        &self,
        _provider: &ProviderKey,
        reference: &Ref,
    ) -> Result<Network, InventoryError> {
        let id = reference.key().unwrap_or_default().to_string();
        Ok(Network {
            name: id.clone(),
            id,
            vlan: None,
        })
    }

    async fn storage(
        &self,
        _provider: &ProviderKey,
        reference: &Ref,
    ) -> Result<Storage, InventoryError> {
        let id = reference.key().unwrap_or_default().to_string();
        Ok(Storage {
            name: id.clone(),
            id,
            ..Default::default()
        })
    }
}

// =============================================================================
// Source platform
// =============================================================================

struct SourceState {
    capabilities: Capabilities,
    power: BTreeMap<String, PowerState>,
    snapshots: BTreeMap<String, SnapshotState>,
    snapshot_seq: u32,
    power_on_calls: usize,
}

/// vSphere-like source whose operations complete immediately
pub(crate) struct FakeSource {
    state: Mutex<SourceState>,
}

impl Default for FakeSource {
    fn default() -> Self {
        Self {
            state: Mutex::new(SourceState {
                capabilities: Capabilities::LIST_VMS
                    | Capabilities::INSPECT
                    | Capabilities::POWER_OFF
                    | Capabilities::POWER_ON
                    | Capabilities::SNAPSHOT
                    | Capabilities::REMOVE_SNAPSHOT
                    | Capabilities::CHANGES
                    | Capabilities::OPEN_DISK
                    | Capabilities::REQUIRES_CONVERSION,
                power: BTreeMap::new(),
                snapshots: BTreeMap::new(),
                snapshot_seq: 0,
                power_on_calls: 0,
            }),
        }
    }
}

fn vm_key(vm: &Ref) -> String {
    vm.key().unwrap_or_default().to_string()
}

impl FakeSource {
    pub fn set_capabilities(&self, capabilities: Capabilities) {
        self.state.lock().capabilities = capabilities;
    }

    /// Power state of a VM; VMs start powered on
    pub fn power(&self, vm: &str) -> PowerState {
        self.state
            .lock()
            .power
            .get(vm)
            .copied()
            .unwrap_or(PowerState::On)
    }

    pub fn power_on_calls(&self) -> usize {
        self.state.lock().power_on_calls
    }

    /// Snapshots not yet removed
    pub fn live_snapshots(&self) -> Vec<String> {
        self.state
            .lock()
            .snapshots
            .iter()
            .filter(|(_, s)| **s != SnapshotState::Gone)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn snapshots_taken(&self) -> u32 {
        self.state.lock().snapshot_seq
    }
}

#[async_trait]
impl SourceAdapter for FakeSource {
    fn provider_type(&self) -> ProviderType {
        ProviderType::VSphere
    }

    fn capabilities(&self) -> Capabilities {
        self.state.lock().capabilities
    }

    async fn list_vms(&self) -> Result<Vec<Vm>, AdapterError> {
        Ok(Vec::new())
    }

    async fn inspect(&self, vm: &Ref) -> Result<Inspection, AdapterError> {
        let power_state = self.power(&vm_key(vm));
        Ok(Inspection {
            vm: Vm {
                id: vm_key(vm),
                name: vm.name.clone().unwrap_or_default(),
                change_tracking_enabled: true,
                ..Default::default()
            },
            power_state,
            checkpointable: true,
        })
    }

    async fn power_state(&self, vm: &Ref) -> Result<PowerState, AdapterError> {
        Ok(self.power(&vm_key(vm)))
    }

    async fn power_off(&self, vm: &Ref) -> Result<(), AdapterError> {
        self.state.lock().power.insert(vm_key(vm), PowerState::Off);
        Ok(())
    }

    async fn power_on(&self, vm: &Ref) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        state.power_on_calls += 1;
        state.power.insert(vm_key(vm), PowerState::On);
        Ok(())
    }

    async fn create_snapshot(&self, _vm: &Ref, _name: &str) -> Result<String, AdapterError> {
        let mut state = self.state.lock();
        state.snapshot_seq += 1;
        let id = format!("snapshot-{}", state.snapshot_seq);
        state.snapshots.insert(id.clone(), SnapshotState::Ready);
        Ok(id)
    }

    async fn snapshot_state(
        &self,
        _vm: &Ref,
        snapshot: &str,
    ) -> Result<SnapshotState, AdapterError> {
        Ok(self
            .state
            .lock()
            .snapshots
            .get(snapshot)
            .cloned()
            .unwrap_or(SnapshotState::Gone))
    }

    async fn remove_snapshot(&self, _vm: &Ref, snapshot: &str) -> Result<(), AdapterError> {
        self.state
            .lock()
            .snapshots
            .insert(snapshot.to_string(), SnapshotState::Gone);
        Ok(())
    }

    async fn changes(
        &self,
        _vm: &Ref,
        disk: &str,
        _baseline: Option<String>,
        snapshot: &str,
    ) -> Result<DiskChanges, AdapterError> {
        Ok(DiskChanges {
            disk: disk.to_string(),
            change_id: Some(format!("{snapshot}/change")),
            extents: vec![Extent {
                start: 0,
                length: 4096,
            }],
        })
    }

    async fn open_disk(
        &self,
        _vm: &Ref,
        disk: &str,
        snapshot: Option<String>,
    ) -> Result<DiskHandle, AdapterError> {
        Ok(DiskHandle {
            kind: DiskSourceKind::Vddk,
            url: "https://vcenter.example.com/sdk".into(),
            disk_id: disk.to_string(),
            snapshot,
            options: BTreeMap::new(),
        })
    }
}

/// Factory handing out the shared [`FakeSource`]
pub(crate) struct FakeSources(pub Arc<FakeSource>);

#[async_trait]
impl SourceFactory for FakeSources {
    async fn source(
        &self,
        _provider: &Provider,
        _secret: Option<Secret>,
    ) -> Result<Arc<dyn SourceAdapter>, PlanError> {
        Ok(self.0.clone())
    }
}

// =============================================================================
// Destination cluster
// =============================================================================

#[derive(Default)]
struct TargetState {
    objects: BTreeMap<(ObjectKind, String, String), TargetObject>,
    created: Vec<(ObjectKind, String)>,
    pods: BTreeMap<String, PodState>,
    metrics: BTreeMap<String, String>,
    jobs: BTreeMap<String, JobState>,
}

/// Destination cluster; pods and jobs succeed unless told otherwise
#[derive(Default)]
pub(crate) struct FakeTarget {
    state: Mutex<TargetState>,
}

impl FakeTarget {
    /// State reported for pod `name` once it exists
    pub fn set_pod(&self, name: &str, state: PodState) {
        self.state.lock().pods.insert(name.to_string(), state);
    }

    pub fn set_metrics(&self, pod: &str, text: &str) {
        self.state
            .lock()
            .metrics
            .insert(pod.to_string(), text.to_string());
    }

    pub fn set_job(&self, name: &str, state: JobState) {
        self.state.lock().jobs.insert(name.to_string(), state);
    }

    /// Names of objects of `kind` ever created, in creation order
    pub fn created(&self, kind: ObjectKind) -> Vec<String> {
        self.state
            .lock()
            .created
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Names of objects of `kind` that exist now
    pub fn live(&self, kind: ObjectKind) -> Vec<String> {
        self.state
            .lock()
            .objects
            .keys()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    pub fn object(&self, kind: ObjectKind, name: &str) -> Option<TargetObject> {
        self.state
            .lock()
            .objects
            .iter()
            .find(|((k, _, n), _)| *k == kind && n == name)
            .map(|(_, o)| o.clone())
    }

    fn contains(&self, kind: ObjectKind, namespace: &str, name: &str) -> bool {
        self.state
            .lock()
            .objects
            .contains_key(&(kind, namespace.to_string(), name.to_string()))
    }
}

#[async_trait]
impl TargetCluster for FakeTarget {
    async fn create(&self, object: &TargetObject) -> Result<(), PlanError> {
        let id = (object.kind(), object.namespace(), object.name());
        let mut state = self.state.lock();
        if !state.objects.contains_key(&id) {
            state.created.push((id.0, id.2.clone()));
            state.objects.insert(id, object.clone());
        }
        Ok(())
    }

    async fn exists(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<bool, PlanError> {
        Ok(self.contains(kind, namespace, name))
    }

    async fn delete(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), PlanError> {
        self.state
            .lock()
            .objects
            .remove(&(kind, namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn pod_state(&self, namespace: &str, name: &str) -> Result<Option<PodState>, PlanError> {
        if !self.contains(ObjectKind::Pod, namespace, name) {
            return Ok(None);
        }
        Ok(Some(
            self.state
                .lock()
                .pods
                .get(name)
                .cloned()
                .unwrap_or(PodState::Succeeded),
        ))
    }

    async fn pod_metrics(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<String>, PlanError> {
        Ok(self.state.lock().metrics.get(name).cloned())
    }

    async fn job_state(&self, namespace: &str, name: &str) -> Result<Option<JobState>, PlanError> {
        if !self.contains(ObjectKind::Job, namespace, name) {
            return Ok(None);
        }
        Ok(Some(
            self.state
                .lock()
                .jobs
                .get(name)
                .cloned()
                .unwrap_or(JobState::Succeeded),
        ))
    }
}

// =============================================================================
// Populator runtime
// =============================================================================

struct RuntimeState {
    workers: Vec<Worker>,
    creates: usize,
    start_phase: WorkerPhase,
}

/// Worker runtime; new workers start in the configured phase
pub(crate) struct FakeWorkerRuntime {
    state: Mutex<RuntimeState>,
}

impl Default for FakeWorkerRuntime {
    fn default() -> Self {
        Self {
            state: Mutex::new(RuntimeState {
                workers: Vec::new(),
                creates: 0,
                start_phase: WorkerPhase::Succeeded,
            }),
        }
    }
}

/// Whether `labels` satisfy a `k=v,k` selector
fn selects(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).is_some_and(|l| l == v),
            None => labels.contains_key(term),
        })
}

impl FakeWorkerRuntime {
    /// Phase of workers created from now on
    pub fn start_in(&self, phase: WorkerPhase) {
        self.state.lock().start_phase = phase;
    }

    /// Move every existing worker to `phase`
    pub fn set_all(&self, phase: WorkerPhase) {
        for worker in self.state.lock().workers.iter_mut() {
            worker.phase = phase;
        }
    }

    pub fn creates(&self) -> usize {
        self.state.lock().creates
    }

    pub fn names(&self) -> Vec<String> {
        self.state
            .lock()
            .workers
            .iter()
            .map(|w| w.name.clone())
            .collect()
    }
}

#[async_trait]
impl WorkerRuntime for FakeWorkerRuntime {
    async fn list(&self, namespace: &str, selector: &str) -> Result<Vec<Worker>, PopulatorError> {
        Ok(self
            .state
            .lock()
            .workers
            .iter()
            .filter(|w| w.namespace == namespace && selects(selector, &w.labels))
            .cloned()
            .collect())
    }

    async fn create(&self, spec: &WorkerSpec) -> Result<Worker, PopulatorError> {
        let mut state = self.state.lock();
        state.creates += 1;
        let worker = Worker {
            name: spec.name.clone(),
            namespace: spec.namespace.clone(),
            labels: spec.labels.clone(),
            phase: state.start_phase,
            created: Some(Utc::now()),
            ..Default::default()
        };
        state.workers.push(worker.clone());
        Ok(worker)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), PopulatorError> {
        self.state
            .lock()
            .workers
            .retain(|w| !(w.namespace == namespace && w.name == name));
        Ok(())
    }

    async fn logs(
        &self,
        _namespace: &str,
        _name: &str,
        _tail: i64,
    ) -> Result<String, PopulatorError> {
        Ok(String::new())
    }

    async fn metrics(&self, worker: &Worker) -> Result<String, PopulatorError> {
        Err(PopulatorError::Scrape {
            worker: worker.name.clone(),
            message: "no metrics endpoint".into(),
        })
    }
}

// =============================================================================
// Events
// =============================================================================

/// Publisher remembering `(reason, note)` pairs
#[derive(Default)]
pub(crate) struct FakeEvents {
    published: Mutex<Vec<(String, String)>>,
}

impl FakeEvents {
    pub fn reasons(&self) -> Vec<String> {
        self.published.lock().iter().map(|(r, _)| r.clone()).collect()
    }
}

#[async_trait]
impl EventPublisher for FakeEvents {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.published
            .lock()
            .push((reason.to_string(), note.unwrap_or_default()));
    }
}

// =============================================================================
// Fixture
// =============================================================================

/// A ready plan over in-memory collaborators
pub(crate) struct Fixture {
    pub kube: Arc<FakeKube>,
    pub inventory: Arc<FakeInventory>,
    pub source: Arc<FakeSource>,
    pub target: Arc<FakeTarget>,
    pub runtime: Arc<FakeWorkerRuntime>,
    pub events: Arc<FakeEvents>,
    settings: Settings,
    context: Mutex<Option<Arc<Context>>>,
    _dir: tempfile::TempDir,
}

/// Inventory VM with one NIC and one disk
pub(crate) fn inventory_vm(id: &str, name: &str, network: &str, datastore: &str) -> Vm {
    Vm {
        id: id.to_string(),
        name: name.to_string(),
        path: format!("/Datacenter/vm/{name}"),
        power_state: "poweredOn".into(),
        firmware: "bios".into(),
        cpu_count: 2,
        memory_mb: 4096,
        change_tracking_enabled: true,
        nics: vec![Nic {
            mac: "00:50:56:00:00:01".into(),
            network: Ref::by_id(network),
        }],
        networks: vec![Ref::by_id(network)],
        disks: vec![Disk {
            id: format!("{id}-disk-0"),
            capacity: 10 * 1024 * 1024 * 1024,
            storage: Ref::by_id(datastore),
            shared: false,
        }],
        ..Default::default()
    }
}

fn ready_provider(name: &str, uid: &str, spec: ProviderSpec) -> Provider {
    let mut provider = named(Provider::new(name, spec), NS);
    provider.metadata.uid = Some(uid.to_string());
    provider.status = Some(ProviderStatus {
        observed_generation: Some(1),
        phase: ProviderPhase::Ready,
        conditions: vec![Condition::truthy(
            READY,
            Category::Required,
            REASON_VALIDATED,
            "The provider is ready.",
        )],
    });
    provider
}

fn provider_pair() -> ProviderPair {
    ProviderPair {
        source: ObjectRef::new("vsphere", NS),
        destination: ObjectRef::new("host", NS),
    }
}

/// The default fixture
pub(crate) fn fixture() -> Fixture {
    fixture_with(|_| {})
}

/// Fixture whose settings are adjusted before the context is built
pub(crate) fn fixture_with(configure: impl FnOnce(&mut Settings)) -> Fixture {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut settings = Settings {
        working_dir: dir.path().to_path_buf(),
        ..Settings::default()
    };
    configure(&mut settings);

    let kube = Arc::new(FakeKube::default());
    kube.edit_plan(|plan| {
        *plan = named(
            Plan::new(
                "plan",
                PlanSpec {
                    target_namespace: TARGET_NS.into(),
                    provider: provider_pair(),
                    map: PlanMaps {
                        network: ObjectRef::new("network-map", NS),
                        storage: ObjectRef::new("storage-map", NS),
                    },
                    vms: vec![PlanVm {
                        vm: Ref::by_id("vm-1"),
                        ..Default::default()
                    }],
                    run_preflight_inspection: true,
                    ..Default::default()
                },
            ),
            NS,
        );
        plan.metadata.uid = Some("plan-uid".into());
    });
    kube.put_provider(ready_provider(
        "vsphere",
        "src-uid",
        ProviderSpec {
            type_: ProviderType::VSphere,
            url: "https://vcenter.example.com/sdk".into(),
            secret: Some(ObjectRef::new("vsphere-credentials", NS)),
            settings: BTreeMap::new(),
        },
    ));
    kube.put_provider(ready_provider(
        "host",
        "host-uid",
        ProviderSpec {
            type_: ProviderType::OpenShift,
            ..Default::default()
        },
    ));
    kube.put_secret(Secret {
        metadata: ObjectMeta {
            name: Some("vsphere-credentials".into()),
            namespace: Some(NS.into()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            ("user".to_string(), ByteString(b"administrator@vsphere.local".to_vec())),
            ("password".to_string(), ByteString(b"secret".to_vec())),
        ])),
        ..Default::default()
    });
    kube.put_network_map(named(
        NetworkMap::new(
            "network-map",
            NetworkMapSpec {
                provider: provider_pair(),
                map: vec![NetworkPair {
                    source: Ref::by_id("net-1"),
                    destination: DestinationNetwork {
                        type_: NetworkType::Pod,
                        ..Default::default()
                    },
                }],
            },
        ),
        NS,
    ));
    kube.put_storage_map(named(
        StorageMap::new(
            "storage-map",
            StorageMapSpec {
                provider: provider_pair(),
                map: vec![StoragePair {
                    source: Ref::by_id("ds-1"),
                    destination: DestinationStorage {
                        storage_class: "standard".into(),
                        ..Default::default()
                    },
                    offload_plugin: None,
                }],
            },
        ),
        NS,
    ));
    kube.put_hook(named(
        Hook::new(
            "quiesce",
            HookSpec {
                image: "quay.io/konveyor/hook-runner:latest".into(),
                ..Default::default()
            },
        ),
        NS,
    ));

    let inventory = Arc::new(FakeInventory::default());
    inventory.put_vm(inventory_vm("vm-1", "web", "net-1", "ds-1"));
    inventory.put_vm(inventory_vm("vm-2", "db", "net-1", "ds-1"));
    inventory.put_vm(inventory_vm("vm-3", "app", "net-1", "ds-1"));
    inventory.put_vm(inventory_vm("unmapped-net", "orphan-net", "net-9", "ds-1"));
    inventory.put_vm(inventory_vm("unmapped-ds", "orphan-ds", "net-1", "ds-9"));

    let source = Arc::new(FakeSource::default());
    let target = Arc::new(FakeTarget::default());
    let runtime = Arc::new(FakeWorkerRuntime::default());
    let events = Arc::new(FakeEvents::default());

    let fx = Fixture {
        kube,
        inventory,
        source,
        target,
        runtime,
        events,
        settings,
        context: Mutex::new(None),
        _dir: dir,
    };
    fx.restart();
    fx
}

impl Fixture {
    fn build_context(&self) -> Arc<Context> {
        let mut ctx = Context::for_testing(
            self.kube.clone(),
            self.inventory.clone(),
            Arc::new(FakeSources(self.source.clone())),
            self.target.clone(),
            Arc::new(Coordinator::new(
                self.runtime.clone(),
                self.settings.importer_retry,
            )),
            self.settings.clone(),
        );
        ctx.events = self.events.clone();
        Arc::new(ctx)
    }

    pub fn context(&self) -> Arc<Context> {
        self.context
            .lock()
            .get_or_insert_with(|| self.build_context())
            .clone()
    }

    /// Replace the context as a restarted controller would: fresh caches,
    /// same cluster and source
    pub fn restart(&self) {
        *self.context.lock() = Some(self.build_context());
    }

    pub fn plan(&self) -> Plan {
        self.kube.plan()
    }

    pub fn edit_plan(&self, edit: impl FnOnce(&mut Plan)) {
        self.kube.edit_plan(edit);
    }

    pub fn edit_provider(&self, name: &str, edit: impl FnOnce(&mut Provider)) {
        self.kube.edit_provider(name, edit);
    }

    /// Add VMs to the plan by source ID
    pub fn select_vms(&self, ids: &[&str]) {
        let vms: Vec<PlanVm> = ids
            .iter()
            .map(|id| PlanVm {
                vm: Ref::by_id(*id),
                ..Default::default()
            })
            .collect();
        self.edit_plan(move |p| p.spec.vms = vms);
    }

    /// Create Migration `name` for the plan
    pub fn migrate(&self, name: &str, created: DateTime<Utc>, cutover: Option<DateTime<Utc>>) {
        let mut migration = named(
            Migration::new(
                name,
                MigrationSpec {
                    plan: ObjectRef::new("plan", NS),
                    cutover,
                    cancel: Vec::new(),
                },
            ),
            NS,
        );
        migration.metadata.creation_timestamp = Some(Time(created));
        migration.metadata.uid = Some(format!("{name}-uid"));
        self.kube.add_migration(migration);
    }

    /// Cancel a VM of a migration
    pub fn cancel(&self, migration: &str, vm: &str) {
        self.kube
            .edit_migration(migration, |m| m.spec.cancel.push(Ref::by_id(vm)));
    }

    pub fn migration_status(&self, name: &str) -> MigrationStatus {
        self.kube
            .migration(name)
            .and_then(|m| m.status)
            .unwrap_or_default()
    }

    pub fn vm(&self, migration: &str, id: &str) -> VmStatus {
        self.migration_status(migration)
            .vms
            .into_iter()
            .find(|v| v.id == id)
            .unwrap_or_else(|| panic!("VM {id} not in migration {migration}"))
    }

    /// One reconcile of the current plan at `now`
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Action {
        let plan = self.plan();
        reconcile_at(&plan, &self.context(), now)
            .await
            .expect("reconcile")
    }

    /// Reconcile repeatedly at `now` so every step that can finish does
    pub async fn settle(&self, now: DateTime<Utc>) {
        for _ in 0..SETTLE_TICKS {
            self.reconcile(now).await;
        }
    }
}

/// A fixed start time for scenarios
pub(crate) fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-02T09:00:00Z")
        .map(|t| t.with_timezone(&Utc))
        .expect("valid timestamp")
}

/// `t0` plus `minutes`
pub(crate) fn at(minutes: i64) -> DateTime<Utc> {
    t0() + ChronoDuration::minutes(minutes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_match_values_and_bare_keys() {
        let labels = BTreeMap::from([
            ("migration".to_string(), "m1".to_string()),
            ("forklift.konveyor.io/populator".to_string(), "vsphere-direct".to_string()),
        ]);
        assert!(selects("migration=m1", &labels));
        assert!(selects("migration=m1,forklift.konveyor.io/populator", &labels));
        assert!(!selects("migration=m2", &labels));
        assert!(!selects("vmID=vm-1", &labels));
    }
}
