//! RMCP 0.3.2 tool handler exposing RTOS thread awareness and core dumps
//!
//! Each connected probe gets a [`DebugSession`] holding the probe-rs session and
//! the [`TaskSession`] fed by halt/run events.

use rmcp::{
    tool, tool_handler, tool_router, ServerHandler,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::*,
    ErrorData as McpError,
    service::RequestContext,
    RoleServer,
};
use tracing::{debug, error, info, warn};
use std::future::Future;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use super::types::*;
use crate::config::Config;
use crate::coredump::{SIGINT, SIGSEGV};
use crate::error::{DebugError, TargetError};
use crate::rtos::format_task_table;
use crate::session::{StopEvent, StopReport, TargetObserver, TaskSession};
use crate::symbols::FrameResolver;
use crate::target::ProbeTarget;

// Probe-rs imports
use probe_rs::probe::list::Lister;
use probe_rs::{CoreStatus, HaltReason, Permissions, Session, VectorCatchCondition};

/// Probe session and the thread state built from it
pub struct Attached {
    pub probe: Session,
    pub tasks: TaskSession,
}

/// Debug session information
pub struct DebugSession {
    pub session_id: String,
    pub probe_identifier: String,
    pub target_chip: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub state: Arc<Mutex<Attached>>,
}

/// Tool handler for thread listing, selection and core dumps
#[derive(Clone)]
pub struct RtosProbeToolHandler {
    #[allow(dead_code)]
    tool_router: ToolRouter<RtosProbeToolHandler>,
    sessions: Arc<RwLock<HashMap<String, Arc<DebugSession>>>>,
    config: Arc<Config>,
}

impl RtosProbeToolHandler {
    pub fn new(config: Config) -> Self {
        Self {
            tool_router: Self::tool_router(),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
        }
    }

    async fn session(&self, session_id: &str) -> Result<Arc<DebugSession>, McpError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| tool_error(DebugError::InvalidSession(session_id.to_string())))
    }

    fn load_resolver(&self, elf_path: Option<&str>) -> Result<FrameResolver, McpError> {
        let path = elf_path.map(PathBuf::from).or_else(|| self.config.debugger.firmware.clone());
        match path {
            Some(path) => FrameResolver::from_elf(&path).map_err(|e| {
                error!("Failed to load symbols from {}: {}", path.display(), e);
                tool_error(DebugError::SymbolError(format!("{}: {}", path.display(), e)))
            }),
            None => {
                warn!("No firmware ELF given, frames will not be symbolized");
                Ok(FrameResolver::default())
            }
        }
    }

    /// Halt the core if needed and run the stop refresh.
    fn stop(&self, attached: &mut Attached) -> Result<StopReport, DebugError> {
        let Attached { probe, tasks } = attached;
        let mut core = probe.core(0)?;

        if !core.core_halted()? {
            core.halt(Duration::from_millis(self.config.debugger.halt_timeout_ms))
                .map_err(|e| TargetError::HaltFailed(e.to_string()))?;
        }
        let event = match core.status()? {
            CoreStatus::Halted(HaltReason::Exception) => StopEvent::Signal(SIGSEGV),
            CoreStatus::Halted(reason) => {
                debug!("Halt reason: {:?}", reason);
                StopEvent::Halted
            }
            other => {
                warn!("Core reports {:?} after halt", other);
                return Err(TargetError::TargetNotHalted.into());
            }
        };

        let mut target = ProbeTarget::new(core);
        tasks.on_stop(&mut target, event)
    }
}

fn tool_error(e: DebugError) -> McpError {
    match e {
        DebugError::UnknownTask(_) | DebugError::NoTarget => McpError::invalid_params(e.to_string(), None),
        other => McpError::internal_error(other.to_string(), None),
    }
}

fn format_stop_report(report: &StopReport) -> String {
    let mut message = String::new();
    if !report.rtos_present {
        message.push_str("No RTOS thread registry found; only the running context is available.\n");
    }
    for task in &report.scan.removed {
        message.push_str(&format!("[Thread '{}' exited]\n", task.name));
    }
    for (label, reason) in &report.scan.failed {
        message.push_str(&format!("Thread {}: registers unavailable ({})\n", label, reason));
    }
    if let Some(path) = &report.snapshot {
        message.push_str(&format!("(core dumped to {:?})\n", path.display().to_string()));
    }
    message
}

#[tool_router]
impl RtosProbeToolHandler {
    // =============================================================================
    // Connection Tools (3 tools)
    // =============================================================================

    #[tool(description = "List all available debug probes (J-Link, ST-Link, DAPLink, etc.)")]
    async fn list_probes(&self, Parameters(_args): Parameters<ListProbesArgs>) -> Result<CallToolResult, McpError> {
        debug!("Listing available debug probes");

        let probes = Lister::new().list_all();
        let message = if probes.is_empty() {
            "No debug probes found.\n\nPlease ensure your probe is connected and drivers are installed.".to_string()
        } else {
            let mut result = format!("Found {} debug probe(s):\n\n", probes.len());
            for (i, probe) in probes.iter().enumerate() {
                result.push_str(&format!("{}. {}\n", i + 1, probe.identifier));
                result.push_str(&format!("   VID:PID = {:04X}:{:04X}\n", probe.vendor_id, probe.product_id));
                if let Some(serial) = &probe.serial_number {
                    result.push_str(&format!("   Serial: {}\n", serial));
                }
                result.push('\n');
            }
            result
        };

        info!("Listed {} debug probes", probes.len());
        Ok(CallToolResult::success(vec![Content::text(message)]))
    }

    #[tool(description = "Connect to a debug probe and target chip, load firmware symbols and scan RTOS threads")]
    async fn connect(&self, Parameters(args): Parameters<ConnectArgs>) -> Result<CallToolResult, McpError> {
        debug!("Connecting to probe '{}' and target '{}'", args.probe_selector, args.target_chip);

        {
            let sessions = self.sessions.read().await;
            if sessions.len() >= self.config.server.max_sessions {
                return Err(tool_error(DebugError::SessionLimitExceeded(self.config.server.max_sessions)));
            }
        }

        let resolver = self.load_resolver(args.elf_path.as_deref())?;

        let probes = Lister::new().list_all();
        let probe_info = if args.probe_selector.to_lowercase() == "auto" {
            probes.first()
        } else {
            probes.iter().find(|p| {
                p.identifier.contains(&args.probe_selector)
                    || p.serial_number.as_deref() == Some(args.probe_selector.as_str())
            })
        }
        .ok_or_else(|| tool_error(DebugError::ProbeNotFound(args.probe_selector.clone())))?;

        info!("Opening probe: {}", probe_info.identifier);
        let probe = probe_info.open().map_err(|e| {
            error!("Failed to open probe '{}': {}", probe_info.identifier, e);
            tool_error(DebugError::ConnectionFailed(format!("{}: {}", probe_info.identifier, e)))
        })?;

        info!("Attaching to target: {}", args.target_chip);
        let mut probe_session = probe.attach(&args.target_chip, Permissions::default()).map_err(|e| {
            error!("Failed to attach to target '{}': {}", args.target_chip, e);
            tool_error(DebugError::ConnectionFailed(format!("{}: {}", args.target_chip, e)))
        })?;

        // Faults halt the core so the next halt reports them
        match probe_session.core(0) {
            Ok(mut core) => {
                if let Err(e) = core.enable_vector_catch(VectorCatchCondition::HardFault) {
                    warn!("Could not enable HardFault vector catch: {}", e);
                }
            }
            Err(e) => warn!("Could not access core 0: {}", e),
        }

        let mut attached = Attached {
            probe: probe_session,
            tasks: TaskSession::new((*self.config).clone(), resolver),
        };

        let mut message = String::new();
        if args.halt_after_connect {
            let report = self.stop(&mut attached).map_err(tool_error)?;
            message.push_str(&format_stop_report(&report));
            let summaries = attached.tasks.list_tasks().map_err(tool_error)?;
            message.push_str(&format_task_table(&summaries));
        }

        let session_id = format!("session_{}", chrono::Utc::now().timestamp_millis());
        let debug_session = DebugSession {
            session_id: session_id.clone(),
            probe_identifier: probe_info.identifier.clone(),
            target_chip: args.target_chip.clone(),
            created_at: chrono::Utc::now(),
            state: Arc::new(Mutex::new(attached)),
        };
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session_id.clone(), Arc::new(debug_session));
        }

        info!("Created debug session: {}", session_id);
        Ok(CallToolResult::success(vec![Content::text(format!(
            "✅ Debug session established!\n\nSession ID: {}\nProbe: {}\nTarget: {}\n\n{}",
            session_id, probe_info.identifier, args.target_chip, message
        ))]))
    }

    #[tool(description = "Disconnect from a debug session and drop its thread state")]
    async fn disconnect(&self, Parameters(args): Parameters<DisconnectArgs>) -> Result<CallToolResult, McpError> {
        debug!("Disconnecting session: {}", args.session_id);

        let removed = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(&args.session_id)
        };
        let session = removed.ok_or_else(|| tool_error(DebugError::InvalidSession(args.session_id.clone())))?;

        {
            let mut state = session.state.lock().await;
            state.tasks.on_exit();
        }

        info!("Disconnected debug session: {}", args.session_id);
        Ok(CallToolResult::success(vec![Content::text(format!(
            "✅ Debug session disconnected\n\nSession ID: {}\nProbe: {}\nTarget: {}\nDuration: {:.1} minutes",
            session.session_id,
            session.probe_identifier,
            session.target_chip,
            (chrono::Utc::now() - session.created_at).num_seconds() as f64 / 60.0
        ))]))
    }

    // =============================================================================
    // Target Control Tools (2 tools)
    // =============================================================================

    #[tool(description = "Halt the target CPU and rebuild the register state of every RTOS thread")]
    async fn halt(&self, Parameters(args): Parameters<HaltArgs>) -> Result<CallToolResult, McpError> {
        debug!("Halting target for session: {}", args.session_id);
        let session = self.session(&args.session_id).await?;
        let mut state = session.state.lock().await;

        let report = self.stop(&mut state).map_err(|e| {
            if e.is_target_communication() {
                error!("Lost contact with target in session {}: {}", args.session_id, e);
            } else {
                error!("Stop refresh failed for session {}: {}", args.session_id, e);
            }
            tool_error(e)
        })?;

        let mut message = String::from("✅ Target halted\n\n");
        if let Some(live) = state.tasks.live_registers() {
            message.push_str(&format!("PC: 0x{:08X}\nSP: 0x{:08X}\n\n", live.pc(), live.sp()));
        }
        message.push_str(&format_stop_report(&report));

        info!("Halt completed for session: {}", args.session_id);
        Ok(CallToolResult::success(vec![Content::text(message)]))
    }

    #[tool(description = "Restore the running thread's registers and resume target CPU execution")]
    async fn run(&self, Parameters(args): Parameters<RunArgs>) -> Result<CallToolResult, McpError> {
        debug!("Running target for session: {}", args.session_id);
        let session = self.session(&args.session_id).await?;
        let mut state = session.state.lock().await;
        let Attached { probe, tasks } = &mut *state;

        let mut target = ProbeTarget::new(probe.core(0).map_err(|e| tool_error(e.into()))?);
        tasks.on_resume(&mut target).map_err(tool_error)?;
        target.core_mut().run().map_err(|e| {
            error!("Failed to run target for session {}: {}", args.session_id, e);
            tool_error(TargetError::ResumeFailed(e.to_string()).into())
        })?;

        info!("Run completed for session: {}", args.session_id);
        Ok(CallToolResult::success(vec![Content::text(
            "✅ Target resumed execution\n\nUse 'halt' to stop and inspect threads.".to_string(),
        )]))
    }

    // =============================================================================
    // Thread Tools (3 tools)
    // =============================================================================

    #[tool(description = "Load symbols from a rebuilt firmware ELF; threads are rescanned at the next halt")]
    async fn load_firmware(&self, Parameters(args): Parameters<LoadFirmwareArgs>) -> Result<CallToolResult, McpError> {
        let session = self.session(&args.session_id).await?;
        let resolver = self.load_resolver(Some(args.elf_path.as_str()))?;

        let mut state = session.state.lock().await;
        let symbol = state.tasks.config().rtos.registry_symbol.clone();
        let registry = resolver.symbols().object_address(&symbol);
        let count = resolver.symbols().symbol_count();
        state.tasks.set_resolver(resolver);

        info!("Loaded {} symbols from {} for session {}", count, args.elf_path, args.session_id);
        let mut message = format!("✅ Loaded {} function symbols from {}\n", count, args.elf_path);
        match registry {
            Some(addr) => message.push_str(&format!("Thread registry '{}' at 0x{:08X}\n", symbol, addr)),
            None => message.push_str(&format!("Symbol '{}' not found; no RTOS threads will be listed\n", symbol)),
        }
        Ok(CallToolResult::success(vec![Content::text(message)]))
    }

    #[tool(description = "List RTOS threads seen at the last halt with their current frame")]
    async fn list_tasks(&self, Parameters(args): Parameters<ListTasksArgs>) -> Result<CallToolResult, McpError> {
        let session = self.session(&args.session_id).await?;
        let state = session.state.lock().await;

        let summaries = state.tasks.list_tasks().map_err(tool_error)?;
        let mut message = format_task_table(&summaries);
        if let Some(current) = state.tasks.current_task().map_err(tool_error)? {
            message.push_str(&format!("\n{}\n", current));
        }
        Ok(CallToolResult::success(vec![Content::text(message)]))
    }

    #[tool(description = "Load a thread's registers into the CPU so it can be inspected")]
    async fn select_task(&self, Parameters(args): Parameters<SelectTaskArgs>) -> Result<CallToolResult, McpError> {
        let session = self.session(&args.session_id).await?;
        let mut state = session.state.lock().await;
        let Attached { probe, tasks } = &mut *state;

        let mut target = ProbeTarget::new(probe.core(0).map_err(|e| tool_error(e.into()))?);
        let selected = tasks.select_task(&mut target, args.thread_id).map_err(tool_error)?;

        Ok(CallToolResult::success(vec![Content::text(format!(
            "[Switching to thread {} ({})]\n#0  {}",
            selected.label, selected.name, selected.frame
        ))]))
    }

    // =============================================================================
    // Core Dump Tools (1 tool)
    // =============================================================================

    #[tool(description = "Write an ELF core file with every RTOS thread and the target RAM")]
    async fn write_snapshot(&self, Parameters(args): Parameters<WriteSnapshotArgs>) -> Result<CallToolResult, McpError> {
        let session = self.session(&args.session_id).await?;
        let mut state = session.state.lock().await;
        let Attached { probe, tasks } = &mut *state;

        let mut target = ProbeTarget::new(probe.core(0).map_err(|e| tool_error(e.into()))?);
        let path = tasks
            .write_snapshot(&mut target, args.path.as_deref().map(Path::new), SIGINT)
            .map_err(|e| {
                error!("Core dump failed for session {}: {}", args.session_id, e);
                tool_error(e)
            })?;

        Ok(CallToolResult::success(vec![Content::text(format!(
            "(core dumped to {:?})",
            path.display().to_string()
        ))]))
    }
}

#[tool_handler]
impl ServerHandler for RtosProbeToolHandler {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some("RTOS-aware debugging for ARM Cortex-M targets via probe-rs. Rebuilds the registers of every kernel thread at each halt and writes ELF core files loadable by gdb-multiarch. Tools: list_probes, connect, disconnect, halt, run, load_firmware, list_tasks, select_task, write_snapshot.".to_string()),
        }
    }

    async fn initialize(
        &self,
        _request: InitializeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, McpError> {
        info!("RTOS probe MCP server initialized");
        Ok(self.get_info())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_session() {
        let handler = RtosProbeToolHandler::new(Config::default());
        let result = handler
            .list_tasks(Parameters(ListTasksArgs {
                session_id: "session_0".to_string(),
            }))
            .await;
        assert!(result.is_err());

        let result = handler
            .select_task(Parameters(SelectTaskArgs {
                session_id: "session_0".to_string(),
                thread_id: 1,
            }))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_unknown_session() {
        let handler = RtosProbeToolHandler::new(Config::default());
        let result = handler
            .disconnect(Parameters(DisconnectArgs {
                session_id: "missing".to_string(),
            }))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_load_firmware_errors() {
        let handler = RtosProbeToolHandler::new(Config::default());
        let result = handler
            .load_firmware(Parameters(LoadFirmwareArgs {
                session_id: "missing".to_string(),
                elf_path: "build/ch.elf".to_string(),
            }))
            .await;
        assert!(result.is_err());

        let err = handler.load_resolver(Some("/nonexistent/ch.elf")).unwrap_err();
        assert_eq!(err.code, ErrorCode::INTERNAL_ERROR);
        assert!(err.message.contains("/nonexistent/ch.elf"));
    }

    #[test]
    fn test_tool_error_kinds() {
        let err = tool_error(DebugError::UnknownTask(4));
        assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
        assert!(err.message.contains("Thread ID 4 not known"));

        let err = tool_error(DebugError::MemoryAccessFailed("x".to_string()));
        assert_eq!(err.code, ErrorCode::INTERNAL_ERROR);
    }

    #[test]
    fn test_server_info_lists_tools() {
        let handler = RtosProbeToolHandler::new(Config::default());
        let info = handler.get_info();
        let instructions = info.instructions.unwrap();
        for tool in ["load_firmware", "list_tasks", "select_task", "write_snapshot"] {
            assert!(instructions.contains(tool));
        }
    }

    #[test]
    fn test_format_stop_report() {
        let report = StopReport {
            rtos_present: true,
            snapshot: Some(PathBuf::from("core-240101-000000")),
            ..StopReport::default()
        };
        assert!(format_stop_report(&report).contains("(core dumped to \"core-240101-000000\")"));

        let report = StopReport::default();
        assert!(format_stop_report(&report).starts_with("No RTOS thread registry"));
    }
}
