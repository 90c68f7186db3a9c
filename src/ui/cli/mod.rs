//! CLI - reedline-based REPL interface
//!
//! Maintenance console for driving displaced stepping by hand against a
//! simulated inferior.

use anyhow::Result;
use colored::Colorize;
use reedline::{Prompt, PromptHistorySearch, PromptHistorySearchStatus, Reedline, Signal};
use std::borrow::Cow;

use crate::app::{parse_command, AppCommand, AppState};
use crate::displaced::{self, dump_bytes, FinishStatus, PrepareStatus};

/// Custom prompt for the maintenance CLI
pub struct DstepPrompt {
    /// Process memory commands act on
    pid: u32,
    /// Busy buffers of that process
    busy: usize,
    total: usize,
}

impl DstepPrompt {
    pub fn new() -> Self {
        Self {
            pid: 0,
            busy: 0,
            total: 0,
        }
    }

    /// Refresh from the session state
    pub fn update(&mut self, state: &AppState) {
        self.pid = state.current_pid();
        let buffers = state.buffers().unwrap_or_default();
        self.busy = buffers.iter().filter(|b| b.owner.is_some()).count();
        self.total = buffers.len();
    }
}

impl Default for DstepPrompt {
    fn default() -> Self {
        Self::new()
    }
}

impl Prompt for DstepPrompt {
    fn render_prompt_left(&self) -> Cow<'_, str> {
        Cow::Owned(format!("[{}:{}/{}]", self.pid, self.busy, self.total))
    }

    fn render_prompt_right(&self) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_indicator(&self, _prompt_mode: reedline::PromptEditMode) -> Cow<'_, str> {
        Cow::Borrowed("> ")
    }

    fn render_prompt_multiline_indicator(&self) -> Cow<'_, str> {
        Cow::Borrowed("... ")
    }

    fn render_prompt_history_search_indicator(
        &self,
        history_search: PromptHistorySearch,
    ) -> Cow<'_, str> {
        let prefix = match history_search.status {
            PromptHistorySearchStatus::Passing => "",
            PromptHistorySearchStatus::Failing => "(failed) ",
        };
        Cow::Owned(format!("(search: {}{}) ", prefix, history_search.term))
    }
}

/// Print the help message
fn print_help() {
    println!("{}", "Displaced Stepping Console".bold().cyan());
    println!("{}", "═".repeat(50).cyan());

    println!("\n{}", "Memory:".bold().yellow());
    println!("  {}   Map zero-filled memory", "map <addr> <size>".green());
    println!("  {}         Unmap a region", "unmap <addr>".green());
    println!("  {}                  Show memory map", "dm".green());
    println!("  {}    Write hex bytes", "poke <addr> <hex>".green());
    println!("  {}       Examine memory", "x <addr> [len]".green());

    println!("\n{}", "Threads:".bold().yellow());
    println!("  {}     Add a stopped thread", "thread <tid> <pc>".green());
    println!("  {}             List threads", "threads".green());
    println!("  {}    Show or set PC", "pc <thr> [value]".green());
    println!("  {}           Set breakpoint", "db <addr>".green());
    println!("  {}          Delete breakpoint", "db- <addr>".green());
    println!("  {} Report a watchpoint stop", "watch <thr> on|off".green());

    println!("\n{}", "Displaced stepping:".bold().yellow());
    println!("  {}       Move thread into a scratch buffer", "prepare <thr>".green());
    println!("  {} Complete a displaced step", "finish <thr> [sig]".green());
    println!("  {}             Show scratch buffers", "buffers".green());
    println!("  {}       Restore scratch into a process", "restore <pid>".green());

    println!("\n{}", "Processes:".bold().yellow());
    println!("  {}  Fork a thread's process", "fork <thr> <pid>".green());
    println!("  {}       Switch process", "process <pid>".green());
    println!("  {}              Detach from process", "detach".green());
    println!("  {}                Process exits", "kill".green());

    println!("\n{}", "Other:".bold().yellow());
    println!("  {} Toggle debug output", "set debug displaced on|off".green());
    println!("  {}                   Show this help", "?".green());
    println!("  {}                   Quit", "q".green());

    println!("\n  {} is <tid> or <pid>.<tid>", "<thr>".green());
}

/// Execute a parsed command. Returns false when the session should end.
fn execute_command(state: &mut AppState, cmd: AppCommand) -> Result<bool> {
    match cmd {
        AppCommand::Map { address, size } => {
            state.map(address, size)?;
            println!("[*] Mapped {:#x}-{:#x}", address, address + size as u64);
        }
        AppCommand::Unmap(address) => {
            state.unmap(address)?;
            println!("[*] Unmapped region at {:#x}", address);
        }
        AppCommand::MemoryMap => {
            println!("[*] Memory Map:");
            for region in state.regions() {
                println!(
                    "    {:#014x}-{:#014x} {}{}{} {}",
                    region.base_address,
                    region.end_address(),
                    if region.protection.read { "r" } else { "-" },
                    if region.protection.write { "w" } else { "-" },
                    if region.protection.execute { "x" } else { "-" },
                    region.name.as_deref().unwrap_or("").dimmed()
                );
            }
        }
        AppCommand::Poke { address, bytes } => {
            state.poke(address, &bytes)?;
            println!("[*] Wrote {} bytes at {:#x}", bytes.len(), address);
        }
        AppCommand::Examine { address, len } => {
            let bytes = state.examine(address, len)?;
            println!("    {:#x}: {}", address, dump_bytes(&bytes));
        }
        AppCommand::Thread { tid, pc } => {
            let ptid = state.spawn_thread(tid, pc)?;
            println!("[*] {} stopped at {:#x}", ptid, pc);
        }
        AppCommand::Threads => {
            for thread in state.debugger.threads() {
                let marker = if thread.displaced_step_state.in_progress() {
                    "displaced".yellow()
                } else {
                    "".normal()
                };
                println!("    {} {}", thread.ptid, marker);
            }
        }
        AppCommand::Pc { thread, value: None } => {
            let pc = state.pc(thread)?;
            println!("    {} pc = {:#x}", state.resolve(thread), pc);
        }
        AppCommand::Pc {
            thread,
            value: Some(pc),
        } => {
            state.set_pc(thread, pc)?;
            println!("    {} pc = {:#x}", state.resolve(thread), pc);
        }
        AppCommand::BreakpointSet(addr) => {
            state.insert_breakpoint(addr)?;
            println!("[*] Breakpoint set at {:#x}", addr);
        }
        AppCommand::BreakpointDelete(addr) => {
            if state.remove_breakpoint(addr)? {
                println!("[*] Breakpoint deleted at {:#x}", addr);
            } else {
                println!("{} No breakpoint at {:#x}", "[!]".red(), addr);
            }
        }
        AppCommand::Watch { thread, stopped } => {
            state.set_watchpoint_stop(thread, stopped);
        }
        AppCommand::Prepare(thread) => match state.prepare(thread)? {
            PrepareStatus::Ok { displaced_pc } => {
                println!("[*] {} displaced to {:#x}", state.resolve(thread), displaced_pc);
            }
            PrepareStatus::Cannot => {
                println!("{} Cannot displaced-step; step in-line", "[!]".yellow());
            }
            PrepareStatus::Unavailable => {
                println!("{} All buffers busy; retry later", "[!]".yellow());
            }
        },
        AppCommand::Finish { thread, signal } => {
            let status = state.finish(thread, signal)?;
            let ptid = state.resolve(thread);
            let pc = state.pc(thread)?;
            match status {
                FinishStatus::Ok => println!("[*] {} done, pc = {:#x}", ptid, pc),
                FinishStatus::NotExecuted => println!(
                    "{} {} stopped with {} before executing, pc = {:#x}",
                    "[!]".yellow(),
                    ptid,
                    signal,
                    pc
                ),
            }
        }
        AppCommand::Buffers => {
            for buffer in state.buffers()? {
                match buffer.owner {
                    Some(owner) => println!("    {:#x} {}", buffer.address, owner),
                    None => println!("    {:#x} {}", buffer.address, "free".dimmed()),
                }
            }
        }
        AppCommand::Restore(pid) => {
            state.restore(pid)?;
            println!("[*] Scratch space restored in process {}", pid);
        }
        AppCommand::Fork { parent, child } => {
            state.fork(parent, child)?;
            println!("[*] {} forked process {}", state.resolve(parent), child);
        }
        AppCommand::Process(pid) => {
            state.select_process(pid)?;
        }
        AppCommand::Detach => {
            let pid = state.current_pid();
            state.detach()?;
            println!("[*] Detached from process {}", pid);
        }
        AppCommand::Kill => {
            let pid = state.current_pid();
            state.exit();
            println!("[*] Process {} exited", pid);
        }
        AppCommand::SetDebugDisplaced(enabled) => {
            displaced::set_debug(enabled);
        }
        AppCommand::ShowDebugDisplaced => {
            let value = if displaced::debug_enabled() { "on" } else { "off" };
            println!("Displaced stepping debugging is {}.", value);
        }
        AppCommand::Help => {
            print_help();
        }
        AppCommand::Quit => {
            println!("[*] Shutting down...");
            return Ok(false);
        }
        AppCommand::Unknown(input) => {
            println!("{} Unknown command: '{}'", "[!]".red(), input);
            println!("    Type '?' for help");
        }
    }
    Ok(true)
}

/// Run the CLI REPL
pub fn run_cli(mut state: AppState) -> Result<()> {
    let mut line_editor = Reedline::create();
    let mut prompt = DstepPrompt::new();

    println!(
        "{}",
        "╔══════════════════════════════════════════════════════════════╗".cyan()
    );
    println!(
        "{}",
        "║  dstep console - Type '?' for help, 'q' to quit              ║".cyan()
    );
    println!(
        "{}",
        "╚══════════════════════════════════════════════════════════════╝".cyan()
    );

    loop {
        prompt.update(&state);
        let sig = line_editor.read_line(&prompt)?;
        match sig {
            Signal::Success(buffer) => {
                let input = buffer.trim();
                if input.is_empty() {
                    continue;
                }

                let cmd = parse_command(input);
                match execute_command(&mut state, cmd) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("{} {}", "[!]".red(), e),
                }
            }
            Signal::CtrlD | Signal::CtrlC => {
                println!("\n[*] Interrupted");
                break;
            }
        }
    }

    Ok(())
}
