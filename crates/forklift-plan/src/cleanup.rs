//! Release of everything a VM's migration created
//!
//! Every helper recorded on the VM is removed, and the record goes with it
//! once the object is gone. Each cleanup step is attempted even when an
//! earlier one failed; the first error is returned so the caller retries.

use std::sync::Arc;

use forklift_adapter::SourceAdapter;
use forklift_common::crd::{HelperKind, VmStatus};
use tracing::{debug, warn};

use crate::controller::Context;
use crate::deltas::delta_key;
use crate::error::PlanError;
use crate::executor::source_secret_name;
use crate::target::ObjectKind;

/// Removes a VM's helpers from the target and the source
pub struct Cleaner<'a> {
    ctx: &'a Context,
    namespace: &'a str,
    migration: &'a str,
    adapter: Option<Arc<dyn SourceAdapter>>,
}

impl<'a> Cleaner<'a> {
    /// Cleaner for VMs of `migration` in target namespace `namespace`
    pub fn new(
        ctx: &'a Context,
        namespace: &'a str,
        migration: &'a str,
        adapter: Option<Arc<dyn SourceAdapter>>,
    ) -> Self {
        Self {
            ctx,
            namespace,
            migration,
            adapter,
        }
    }

    /// Remove the VM's helpers
    ///
    /// The target VirtualMachine and its volumes are removed only when
    /// `delete_target` is set; scratch volumes always go.
    pub async fn cleanup(&self, vm: &mut VmStatus, delete_target: bool) -> Result<(), PlanError> {
        let mut first: Option<PlanError> = None;
        let mut keep = |result: Result<(), PlanError>| {
            if let Err(e) = result {
                warn!(error = %e, "cleanup step failed");
                first.get_or_insert(e);
            }
        };

        let mut kinds = vec![];
        if delete_target {
            kinds.extend([
                HelperKind::VirtualMachine,
                HelperKind::DataVolume,
                HelperKind::PersistentVolumeClaim,
            ]);
        }
        for kind in kinds {
            keep(self.delete_helpers(vm, kind, |_| true).await);
        }
        keep(
            self.delete_helpers(vm, HelperKind::DataVolume, |name| name.ends_with("-scratch"))
                .await,
        );

        match self
            .ctx
            .populators
            .reap(self.namespace, self.migration, Some(&vm.id))
            .await
        {
            Ok(_) => {
                vm.helpers.retain(|h| h.kind != HelperKind::PopulatorWorker);
                for disk in vm.disks.iter_mut() {
                    disk.worker = None;
                }
            }
            Err(e) => keep(Err(e.into())),
        }

        for kind in [
            HelperKind::ConversionPod,
            HelperKind::ImageConverter,
            HelperKind::HookJob,
            HelperKind::HookConfigMap,
        ] {
            keep(self.delete_helpers(vm, kind, |_| true).await);
        }

        keep(self.remove_snapshots(vm).await);
        self.ctx.deltas.forget(&delta_key(self.migration, &vm.id));

        match first {
            Some(e) => Err(e),
            None => {
                debug!(vm = %vm.id, delete_target, "cleaned up VM");
                Ok(())
            }
        }
    }

    /// Remove migration-wide helpers: the copied credentials and any
    /// populator worker not tied to a listed VM
    pub async fn release(&self) -> Result<(), PlanError> {
        self.ctx
            .target
            .delete(
                ObjectKind::Secret,
                self.namespace,
                &source_secret_name(self.migration),
            )
            .await?;
        let reaped = self
            .ctx
            .populators
            .reap(self.namespace, self.migration, None)
            .await?;
        debug!(migration = self.migration, reaped, "released migration");
        Ok(())
    }

    async fn delete_helpers(
        &self,
        vm: &mut VmStatus,
        kind: HelperKind,
        select: impl Fn(&str) -> bool,
    ) -> Result<(), PlanError> {
        let Some(object) = ObjectKind::of_helper(kind) else {
            return Ok(());
        };
        let names: Vec<String> = vm
            .helpers_of(kind)
            .map(|h| h.name.clone())
            .filter(|n| select(n))
            .collect();
        for name in names {
            self.ctx.target.delete(object, self.namespace, &name).await?;
            vm.remove_helper(kind, &name);
        }
        Ok(())
    }

    async fn remove_snapshots(&self, vm: &mut VmStatus) -> Result<(), PlanError> {
        let names: Vec<String> = vm
            .helpers_of(HelperKind::Snapshot)
            .map(|h| h.name.clone())
            .collect();
        if names.is_empty() {
            return Ok(());
        }
        let Some(adapter) = &self.adapter else {
            warn!(
                vm = %vm.id,
                snapshots = names.len(),
                "no source adapter; snapshots left on the source"
            );
            return Ok(());
        };
        let reference = vm.vm_ref();
        for name in names {
            adapter.remove_snapshot(&reference, &name).await?;
            vm.remove_helper(HelperKind::Snapshot, &name);
        }
        if let Some(warm) = vm.warm.as_mut() {
            warm.current_snapshot = None;
            warm.previous_snapshot = None;
        }
        Ok(())
    }
}
