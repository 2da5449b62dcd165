use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::event::DeviceEvent;
use super::multi_source::MultiSourceHandler;
use crate::config::Config;
use crate::config::ManagerConfig;
use crate::device::Device;
use crate::device::DeviceMap;
use crate::device::SharedDeviceMap;
use crate::error::Error;
use crate::merge::MergingManager;
use crate::source::message;
use crate::source::Command;
use crate::source::FactoryContext;
use crate::source::Scene;
use crate::source::SetupContext;
use crate::source::SourceAccount;
use crate::source::SourceMessage;
use crate::source::SourceMessageReceiver;
use crate::source::SourceMessageSender;
use crate::source::StatusEntry;
use crate::source::StreamType;
use crate::source::SOURCE_REGISTRY;
use crate::virtual_handlers::DescriptorRegistry;
use crate::virtual_handlers::DescriptorsByCategory;
use crate::virtual_handlers::VirtualCommand;
use crate::virtual_handlers::VirtualFunctionHandler;
use crate::virtual_handlers::VirtualStateHandler;
use crate::watcher::DeviceWatcher;

/// Capacity for the source→manager message channel
const FROM_SOURCE_CHANNEL_SIZE: usize = 256;

/// Capacity for the device event broadcast; slow subscribers lag
const EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ManagerState {
    Uninitialized,
    SettingUp,
    Ready,
    Refreshing,
    Unloading,
}

/// Aggregates every registered source account.
///
/// The manager owns the accounts, merges the devices they report into one
/// view per device id, routes push messages and commands, and applies the
/// virtual capabilities on the way.
pub struct MultiManager {
    state: Mutex<ManagerState>,

    /// Accounts in registration order, addressed by type name
    accounts: Vec<Box<dyn SourceAccount>>,

    descriptors: Arc<DescriptorRegistry>,
    virtual_state_handler: VirtualStateHandler,
    virtual_function_handler: VirtualFunctionHandler,
    multi_source_handler: Mutex<MultiSourceHandler>,
    device_watcher: DeviceWatcher,

    /// Serializes cache refreshes; merges lock two devices at once
    refresh_lock: Mutex<()>,

    events: broadcast::Sender<DeviceEvent>,

    /// Handed to accounts during setup; dropped on unload so `run` can end
    message_tx: Mutex<Option<SourceMessageSender>>,
    message_rx: tokio::sync::Mutex<SourceMessageReceiver>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MultiManager {
    pub fn new(config: &ManagerConfig) -> Self {
        let (message_tx, message_rx) = mpsc::channel(FROM_SOURCE_CHANNEL_SIZE);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let descriptors = Arc::new(DescriptorRegistry::new());

        let device_watcher = DeviceWatcher::new();
        for device_id in &config.watched_devices {
            device_watcher.watch(device_id);
        }

        Self {
            state: Mutex::new(ManagerState::Uninitialized),
            accounts: Vec::new(),
            virtual_state_handler: VirtualStateHandler::new(descriptors.clone()),
            virtual_function_handler: VirtualFunctionHandler::new(descriptors.clone()),
            descriptors,
            multi_source_handler: Mutex::new(MultiSourceHandler::new(Duration::from_secs(
                config.authority_window_secs,
            ))),
            device_watcher,
            refresh_lock: Mutex::new(()),
            events,
            message_tx: Mutex::new(Some(message_tx)),
            message_rx: tokio::sync::Mutex::new(message_rx),
        }
    }

    pub fn state(&self) -> ManagerState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ManagerState) {
        debug!("Manager state: {}", state);
        *lock(&self.state) = state;
    }

    /// Create every source plugin from the registry and set them up.
    ///
    /// Plugins whose factory returns `Ok(None)` are not configured and are
    /// skipped; factory errors abort setup.
    pub async fn setup(&mut self, config: &Config) -> Result<(), Error> {
        let ctx = FactoryContext { config };
        let mut candidates = Vec::new();
        for factory in SOURCE_REGISTRY {
            match factory(&ctx) {
                Ok(Some(account)) => candidates.push(account),
                Ok(None) => continue,
                Err(e) => return Err(Error::Factory(e)),
            }
        }
        self.setup_accounts(config, candidates).await
    }

    /// Set up candidate accounts one at a time, in order, and register the
    /// ones that report success.
    ///
    /// An account error aborts setup; accounts registered before it stay
    /// registered and are released by [`unload`](Self::unload).
    pub async fn setup_accounts(
        &mut self,
        config: &Config,
        candidates: Vec<Box<dyn SourceAccount>>,
    ) -> Result<(), Error> {
        let state = self.state();
        if state != ManagerState::Uninitialized {
            return Err(Error::InvalidState {
                operation: "set up",
                state,
            });
        }
        let messages = lock(&self.message_tx).clone().ok_or(Error::InvalidState {
            operation: "set up",
            state: ManagerState::Unloading,
        })?;

        self.set_state(ManagerState::SettingUp);
        let ctx = SetupContext { config, messages };

        for mut account in candidates {
            let name = account.get_type_name().to_string();
            match account.setup_from_entry(&ctx).await {
                Ok(true) => {
                    info!("Source '{}' set up", name);
                    self.register_account(account);
                }
                Ok(false) => info!("Source '{}' is not available, skipping", name),
                Err(e) => {
                    self.set_state(ManagerState::Uninitialized);
                    return Err(Error::source_failed(&name, e));
                }
            }
        }

        for account in &self.accounts {
            account.on_post_setup();
        }
        self.set_state(ManagerState::Ready);
        Ok(())
    }

    /// Register under the account's type name. A second account with the
    /// same name replaces the first in place.
    fn register_account(&mut self, account: Box<dyn SourceAccount>) {
        let name = account.get_type_name().to_string();
        match self.accounts.iter().position(|a| a.get_type_name() == name) {
            Some(index) => {
                warn!("Source '{}' registered twice, replacing", name);
                self.accounts[index] = account;
            }
            None => self.accounts.push(account),
        }
    }

    pub fn account_names(&self) -> Vec<String> {
        self.accounts
            .iter()
            .map(|account| account.get_type_name().to_string())
            .collect()
    }

    pub fn get_account_by_name(&self, name: &str) -> Option<&dyn SourceAccount> {
        self.accounts
            .iter()
            .find(|account| account.get_type_name() == name)
            .map(|account| account.as_ref())
    }

    pub fn device_watcher(&self) -> &DeviceWatcher {
        &self.device_watcher
    }

    /// Subscribe to device notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: DeviceEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn get_available_device_maps(&self) -> Vec<SharedDeviceMap> {
        self.accounts
            .iter()
            .flat_map(|account| account.get_available_device_maps())
            .collect()
    }

    /// One handle per device id, taken from the first map (in registration
    /// order) that contains it.
    pub fn device_map(&self) -> DeviceMap {
        let mut devices = DeviceMap::new();
        for map in self.get_available_device_maps() {
            for (device_id, device) in map.lock().iter() {
                if !devices.contains_key(device_id) {
                    devices.insert(device_id.clone(), device.clone());
                }
            }
        }
        devices
    }

    /// Every handle of a device id across all maps, in registration order.
    pub fn get_devices_from_device_id(&self, device_id: &str) -> Vec<Device> {
        self.get_available_device_maps()
            .iter()
            .filter_map(|map| map.lock().get(device_id).cloned())
            .collect()
    }

    pub fn register_device_descriptors(&self, platform: &str, descriptors: DescriptorsByCategory) {
        debug!(
            "Registering descriptors of {} for {} categories",
            platform,
            descriptors.len()
        );
        self.descriptors.register(platform, descriptors);
    }

    pub fn registered_platforms(&self) -> Vec<String> {
        self.descriptors.platforms()
    }

    /// Sources that have reported status for the device, sorted.
    pub fn sources_of_device(&self, device_id: &str) -> Vec<String> {
        lock(&self.multi_source_handler).sources_of(device_id)
    }

    /// Source currently holding authority over one status code of a device.
    pub fn authoritative_source_of(&self, device_id: &str, code: &str) -> Option<String> {
        lock(&self.multi_source_handler)
            .authoritative_source(device_id, code)
            .map(str::to_string)
    }

    /// Refresh every account's inventory, then merge devices seen by several
    /// accounts.
    pub fn update_device_cache(&self) {
        let _refreshing = lock(&self.refresh_lock);
        let previous = self.state();
        if previous == ManagerState::Unloading {
            warn!("Ignoring device cache refresh while unloading");
            return;
        }

        self.set_state(ManagerState::Refreshing);
        let before: Vec<String> = self.device_map().into_keys().collect();
        for account in &self.accounts {
            account.update_device_cache();
        }
        self.merge_devices_from_multiple_sources();
        let devices = self.device_map();
        {
            let mut handler = lock(&self.multi_source_handler);
            for device_id in before.iter().filter(|id| !devices.contains_key(*id)) {
                debug!("{} left every source, dropping its authority records", device_id);
                handler.forget_device(device_id);
            }
        }
        self.set_state(previous);

        let device_count = devices.len();
        info!("Device cache refreshed, {} devices", device_count);
        self.notify(DeviceEvent::DevicesRefreshed { device_count });
    }

    /// Left-fold every copy of a device id into the first one, then write
    /// the merged handles back into their maps.
    fn merge_devices_from_multiple_sources(&self) {
        let maps = self.get_available_device_maps();
        let device_ids: Vec<String> = self.device_map().into_keys().collect();

        for device_id in device_ids {
            let mut copies: Vec<(usize, Device)> = maps
                .iter()
                .enumerate()
                .filter_map(|(index, map)| map.lock().get(&device_id).cloned().map(|d| (index, d)))
                .collect();
            if copies.len() < 2 {
                continue;
            }

            if let Some(((_, merged), rest)) = copies.split_first_mut() {
                for (_, device) in rest.iter_mut() {
                    MergingManager::merge(merged, device);
                }
                for (_, device) in rest.iter_mut() {
                    if device.data_model.is_empty() {
                        device.data_model = merged.data_model.clone();
                    }
                }
            }

            for (index, device) in copies {
                maps[index].lock().insert(device_id.clone(), device);
            }
        }
    }

    /// Route commands to every account, executing virtual functions locally
    /// first. Commands for unknown devices are dropped.
    pub fn send_commands(&self, device_id: &str, commands: &[Command]) -> Result<(), Error> {
        let Some(device) = self.get_devices_from_device_id(device_id).into_iter().next() else {
            warn!("Dropping commands for unknown device {}", device_id);
            return Ok(());
        };
        self.device_watcher
            .report_with(device_id, Some(&device), || format!("send_commands {:?}", commands));

        let virtual_functions = self
            .virtual_function_handler
            .get_category_virtual_functions(&device.category);
        let mut regular_commands = Vec::new();
        let mut virtual_commands = Vec::new();
        for command in commands {
            match VirtualFunctionHandler::find_virtual_function(&virtual_functions, &command.code) {
                Some(descriptor) => virtual_commands.push(VirtualCommand {
                    code: command.code.clone(),
                    value: command.value.clone(),
                    descriptor: descriptor.clone(),
                }),
                None => regular_commands.push(command.clone()),
            }
        }

        if !virtual_commands.is_empty() {
            let outcome = self
                .virtual_function_handler
                .process_virtual_function(&device, &virtual_commands);
            if !outcome.reset_codes.is_empty() {
                self.notify(DeviceEvent::StatusUpdated {
                    device_id: device_id.to_string(),
                    codes: outcome.reset_codes,
                });
            }
            regular_commands.extend(outcome.commands);
        }

        if regular_commands.is_empty() {
            return Ok(());
        }
        for account in &self.accounts {
            account
                .send_commands(device_id, &regular_commands)
                .map_err(|e| Error::source_failed(account.get_type_name(), e))?;
        }
        Ok(())
    }

    /// Handle a push message received by `source`.
    ///
    /// Status reports are normalized to code/dpId/value entries, arbitrated
    /// between sources, expanded with virtual states and written to the
    /// device before the owning account sees the message.
    pub fn on_message(&self, source: &str, message: Value) -> Result<(), Error> {
        let Some(device_id) = message::device_id_from_message(&message) else {
            warn!("Dropping message from '{}' without a device id", source);
            return Ok(());
        };
        self.device_watcher
            .report_with(&device_id, None, || format!("on_message from {}: {}", source, message));

        let mut message = message::normalize_message(message);

        if let Some(status_list) = message::status_list_from_message(&message) {
            let (status_list, resolved) = self.resolve_status_list(&device_id, &status_list);
            self.device_watcher
                .report_with(&device_id, None, || format!("normalized status {:?}", status_list));

            let authoritative = lock(&self.multi_source_handler).register_status_list_from_source(
                &device_id,
                source,
                &resolved,
                Instant::now(),
            );
            let codes = self.apply_status_list(&device_id, authoritative);
            if !codes.is_empty() {
                self.notify(DeviceEvent::StatusUpdated {
                    device_id: device_id.clone(),
                    codes,
                });
            }

            if let Err(e) = message::replace_status_list(&mut message, &status_list) {
                warn!("{}: failed to rewrite status list: {}", device_id, e);
            }
        }

        match self.get_account_by_name(source) {
            Some(account) => account
                .on_message(&message)
                .map_err(|e| Error::source_failed(source, e)),
            None => {
                debug!("No account named '{}' for message", source);
                Ok(())
            }
        }
    }

    /// Resolve every entry to code, dpId and value using the local
    /// strategies of every copy of the device. Unresolvable entries are
    /// kept unchanged.
    pub fn convert_device_report_status_list(
        &self,
        device_id: &str,
        status_list: &[StatusEntry],
    ) -> Vec<StatusEntry> {
        self.resolve_status_list(device_id, status_list).0
    }

    /// Returns the list to forward, in report order, and the subset that
    /// resolved and may be written to the device.
    fn resolve_status_list(
        &self,
        device_id: &str,
        status_list: &[StatusEntry],
    ) -> (Vec<StatusEntry>, Vec<StatusEntry>) {
        let devices = self.get_devices_from_device_id(device_id);
        let mut forwarded = Vec::with_capacity(status_list.len());
        let mut resolved = Vec::with_capacity(status_list.len());
        for entry in status_list {
            match resolve_status_entry(&devices, entry) {
                Some(entry) => {
                    forwarded.push(entry.clone());
                    resolved.push(entry);
                }
                None => {
                    warn!("{}: cannot resolve status entry {:?}", device_id, entry);
                    forwarded.push(entry.clone());
                }
            }
        }
        (forwarded, resolved)
    }

    /// Expand with virtual states and write into every distinct status
    /// cell of the device. Returns the written codes.
    fn apply_status_list(&self, device_id: &str, status_list: Vec<StatusEntry>) -> Vec<String> {
        let devices = self.get_devices_from_device_id(device_id);
        let Some(device) = devices.first() else {
            warn!("Status for unknown device {}", device_id);
            return Vec::new();
        };
        let status_list = self
            .virtual_state_handler
            .apply_virtual_states_to_status_list(device, status_list);

        let mut written: Vec<&Device> = Vec::new();
        for device in &devices {
            if written.iter().any(|other| other.status.ptr_eq(&device.status)) {
                continue;
            }
            let mut status = device.status.lock();
            for entry in &status_list {
                if let Some(code) = &entry.code {
                    status.insert(code.clone(), entry.value.clone());
                }
            }
            written.push(device);
        }
        self.device_watcher
            .report_with(device_id, Some(device), || "status applied".to_string());

        let mut codes: Vec<String> = Vec::new();
        for code in status_list.into_iter().filter_map(|entry| entry.code) {
            if !codes.contains(&code) {
                codes.push(code);
            }
        }
        codes
    }

    /// Process messages pushed by the accounts until every sender is gone.
    pub async fn run(&self) {
        info!("Manager starting");

        let mut rx = self.message_rx.lock().await;
        while let Some(SourceMessage { source, payload }) = rx.recv().await {
            if let Err(e) = self.on_message(&source, payload) {
                warn!("Error handling message from '{}': {}", source, e);
            }
        }

        info!("Manager shutting down");
    }

    pub fn get_domain_identifiers_of_device(&self, device_id: &str) -> Vec<String> {
        self.accounts
            .iter()
            .flat_map(|account| account.get_domain_identifiers_of_device(device_id))
            .collect()
    }

    pub fn get_platform_descriptors_to_merge(&self, platform: &str) -> Vec<DescriptorsByCategory> {
        self.accounts
            .iter()
            .filter_map(|account| account.get_platform_descriptors_to_merge(platform))
            .filter(|descriptors| !descriptors.is_empty())
            .collect()
    }

    pub fn query_scenes(&self) -> Vec<Scene> {
        self.accounts
            .iter()
            .flat_map(|account| account.query_scenes())
            .collect()
    }

    /// Stream URL from the first account that can provide one.
    pub fn get_device_stream_allocate(&self, device_id: &str, stream_type: StreamType) -> Option<String> {
        self.accounts.iter().find_map(|account| {
            account
                .get_device_stream_allocate(device_id, stream_type)
                .filter(|url| !url.is_empty())
        })
    }

    pub fn refresh_mq(&self) {
        for account in &self.accounts {
            account.refresh_mq();
        }
    }

    pub fn remove_device_listeners(&self) {
        for account in &self.accounts {
            account.remove_device_listeners();
        }
    }

    /// Release every account. Repeated calls do nothing.
    pub fn unload(&self) {
        let Some(sender) = lock(&self.message_tx).take() else {
            debug!("Manager already unloaded");
            return;
        };
        drop(sender);

        self.set_state(ManagerState::Unloading);
        for account in &self.accounts {
            info!("Unloading source '{}'", account.get_type_name());
            account.unload();
        }
        lock(&self.multi_source_handler).clear();
    }
}

impl Default for MultiManager {
    fn default() -> Self {
        Self::new(&ManagerConfig::default())
    }
}

/// Fill in whichever of code and dpId is missing, trying each copy of the
/// device in turn. Entries that only carry a dpId-named key take that key's
/// value.
fn resolve_status_entry(devices: &[Device], entry: &StatusEntry) -> Option<StatusEntry> {
    let mut code = entry.code.clone();
    let mut dp_id = entry.dp_id;
    let mut value = entry.value.clone();

    for device in devices {
        if code.is_none() {
            code = dp_id.and_then(|dp_id| device.code_for_dp_id(dp_id));
        }
        if dp_id.is_none() {
            dp_id = code.as_deref().and_then(|code| device.dp_id_for_code(code));
        }
        if code.is_none() && dp_id.is_none() {
            let keyed = entry
                .dp_id_keyed_values()
                .find_map(|(id, raw)| device.code_for_dp_id(id).map(|c| (id, c, raw.clone())));
            if let Some((id, c, raw)) = keyed {
                dp_id = Some(id);
                code = Some(c);
                value = raw;
            }
        }
        if code.is_some() && dp_id.is_some() {
            break;
        }
    }

    let mut extra = entry.extra.clone();
    extra.retain(|key, _| key.parse::<u32>().is_err());
    Some(StatusEntry {
        code: Some(code?),
        dp_id: Some(dp_id?),
        value,
        extra,
    })
}
