//! Integration tests for the debugger session
//!
//! Run with: cargo test --test debugger_session -- --nocapture

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use dstep::arch::{displaced_step_buffer_addresses, Amd64};
    use dstep::arch::x86_64::Amd64Closure;
    use dstep::core::memory::{MemoryProtection, MemoryRegion, TargetMemory};
    use dstep::core::registers::RegisterState;
    use dstep::core::sim::SimulatedTarget;
    use dstep::core::{DebugError, Debugger, Ptid, StopSignal, Target};
    use dstep::displaced::{FinishStatus, PrepareStatus};

    const PID: u32 = 4242;
    const ENTRY: u64 = 0x401000;
    const CODE: u64 = 0x401100;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Two scratch buffers past the entry point; `nop; nop` at CODE with a
    /// breakpoint on the first one; main thread stopped there.
    fn session() -> (Debugger<SimulatedTarget>, Vec<u64>) {
        init_logger();

        let main = Ptid::process(PID);
        let mut target = SimulatedTarget::new();
        target.map(PID, MemoryRegion::new(0x401000, 0x1000, MemoryProtection::RX));
        target.add_thread(main, RegisterState::at_pc(CODE));
        target.write_memory(main, CODE, &[0x90, 0x90]).unwrap();
        target.insert_breakpoint(main, CODE, &[0xcc]).unwrap();

        let scratch = displaced_step_buffer_addresses(&Amd64, ENTRY, 2);
        let mut debugger = Debugger::new(target, Rc::new(Amd64), scratch.clone());
        debugger.attach(PID).unwrap();
        (debugger, scratch)
    }

    #[test]
    fn test_step_over_breakpoint() {
        let (mut debugger, scratch) = session();
        let main = Ptid::process(PID);

        let status = debugger.displaced_step_prepare(main).unwrap();
        assert_eq!(status, PrepareStatus::Ok { displaced_pc: scratch[0] });
        assert!(debugger.thread(main).unwrap().displaced_step_state.in_progress());

        let closure = debugger
            .displaced_step_closure_at(PID, scratch[0])
            .and_then(|c| c.as_any().downcast_ref::<Amd64Closure>())
            .expect("scratch buffer is busy");
        assert_eq!(closure.insn[0], 0x90);

        // nop executed in the scratch pad
        debugger.target_mut().write_pc(main, scratch[0] + 1).unwrap();
        let status = debugger.displaced_step_finish(main, StopSignal::Trap).unwrap();
        assert_eq!(status, FinishStatus::Ok);
        assert_eq!(debugger.target_mut().read_pc(main), Ok(CODE + 1));
        // The breakpoint never left.
        assert_eq!(debugger.target_mut().read_raw(main, CODE, 1).unwrap(), vec![0xcc]);
    }

    #[test]
    fn test_detach_restores_scratch() {
        let (mut debugger, scratch) = session();
        let main = Ptid::process(PID);
        let original = debugger.target_mut().read_raw(main, scratch[0], 16).unwrap();

        debugger.displaced_step_prepare(main).unwrap();
        assert_ne!(
            debugger.target_mut().read_raw(main, scratch[0], 16).unwrap(),
            original
        );

        debugger.detach(PID).unwrap();
        assert!(debugger.inferior(PID).is_none());
        assert!(debugger.thread(main).is_none());
        assert_eq!(
            debugger.target_mut().read_raw(main, scratch[0], 16).unwrap(),
            original
        );
        // Detaching lifted the breakpoint too.
        assert_eq!(debugger.target_mut().read_raw(main, CODE, 1).unwrap(), vec![0x90]);
    }

    #[test]
    fn test_fork_child_gets_clean_scratch() {
        let (mut debugger, scratch) = session();
        let main = Ptid::process(PID);
        let original = debugger.target_mut().read_raw(main, scratch[0], 16).unwrap();

        debugger.displaced_step_prepare(main).unwrap();
        debugger.target_mut().fork(main, 5000).unwrap();
        debugger.handle_fork(main, 5000).unwrap();

        let child = Ptid::process(5000);
        assert_eq!(
            debugger.target_mut().read_raw(child, scratch[0], 16).unwrap(),
            original
        );
        // The child inherits the breakpoint and a pool of its own.
        assert!(debugger.target().breakpoint_inserted_in_range(child, CODE, 1));
        let pool = &debugger.inferior(5000).unwrap().displaced_buffers;
        assert!(pool.has_free_buffer());
        assert_eq!(pool.owner(scratch[0]), None);
        assert_eq!(
            debugger.inferior(PID).unwrap().displaced_buffers.owner(scratch[0]),
            Some(main)
        );
    }

    #[test]
    fn test_exit_forgets_process() {
        let (mut debugger, _) = session();
        let main = Ptid::process(PID);
        debugger.add_thread(Ptid::new(PID, PID + 1)).unwrap();
        debugger.displaced_step_prepare(main).unwrap();

        debugger.handle_exit(PID);
        assert!(debugger.inferior(PID).is_none());
        assert_eq!(debugger.threads().count(), 0);
        assert!(!debugger.target().has_process(PID));
    }

    #[test]
    fn test_unknown_process_and_thread() {
        let (mut debugger, _) = session();

        assert!(matches!(
            debugger.displaced_step_prepare(Ptid::process(1)),
            Err(DebugError::ProcessNotFound { pid: 1 })
        ));
        let stranger = Ptid::new(PID, 77);
        assert!(matches!(
            debugger.displaced_step_prepare(stranger),
            Err(DebugError::ThreadNotFound(ptid)) if ptid == stranger
        ));
        assert!(matches!(
            debugger.add_thread(Ptid::new(1, 2)),
            Err(DebugError::ProcessNotFound { pid: 1 })
        ));
        assert!(matches!(
            debugger.attach(31337),
            Err(DebugError::AttachFailed { pid: 31337, .. })
        ));
    }

    #[test]
    fn test_second_thread_shares_pool() {
        let (mut debugger, scratch) = session();
        let main = Ptid::process(PID);
        let worker = Ptid::new(PID, PID + 1);
        debugger.target_mut().add_thread(worker, RegisterState::at_pc(CODE));
        debugger.add_thread(worker).unwrap();

        assert_eq!(
            debugger.displaced_step_prepare(main).unwrap(),
            PrepareStatus::Ok { displaced_pc: scratch[0] }
        );
        assert_eq!(
            debugger.displaced_step_prepare(worker).unwrap(),
            PrepareStatus::Ok { displaced_pc: scratch[1] }
        );
        assert!(debugger.inferior(PID).unwrap().displaced_step_state.unavailable);

        debugger.target_mut().write_pc(worker, scratch[1] + 1).unwrap();
        debugger.displaced_step_finish(worker, StopSignal::Trap).unwrap();
        assert!(!debugger.inferior(PID).unwrap().displaced_step_state.unavailable);
        assert_eq!(debugger.target_mut().read_pc(worker), Ok(CODE + 1));
    }

    #[test]
    fn test_fork_keeps_breakpoint_in_busy_scratch() {
        let (mut debugger, scratch) = session();
        let main = Ptid::process(PID);

        debugger.displaced_step_prepare(main).unwrap();
        // A breakpoint lands on the relocated copy after the step began.
        debugger.target_mut().insert_breakpoint(main, scratch[0], &[0xcc]).unwrap();

        debugger.target_mut().fork(main, 5000).unwrap();
        debugger.handle_fork(main, 5000).unwrap();

        let child = Ptid::process(5000);
        assert!(debugger.target().breakpoint_inserted_in_range(child, scratch[0], 1));
        assert_eq!(debugger.target_mut().read_raw(child, scratch[0], 1).unwrap(), vec![0xcc]);
        // Under the breakpoint the child sees its original scratch byte.
        assert_eq!(debugger.target_mut().read_vec(child, scratch[0], 2).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_repeated_prepare_is_an_error() {
        let (mut debugger, scratch) = session();
        let main = Ptid::process(PID);

        debugger.displaced_step_prepare(main).unwrap();
        assert!(matches!(
            debugger.displaced_step_prepare(main),
            Err(DebugError::AlreadyStepping(ptid)) if ptid == main
        ));

        // The step in flight is untouched.
        let pool = &debugger.inferior(PID).unwrap().displaced_buffers;
        assert_eq!(pool.owner(scratch[0]), Some(main));
        assert_eq!(pool.owner(scratch[1]), None);
        assert!(debugger.thread(main).unwrap().displaced_step_state.in_progress());
    }

    #[test]
    fn test_finish_without_prepare_is_an_error() {
        let (mut debugger, _) = session();
        let main = Ptid::process(PID);
        let pc = debugger.target_mut().read_pc(main).unwrap();

        assert!(matches!(
            debugger.displaced_step_finish(main, StopSignal::Trap),
            Err(DebugError::NotStepping(ptid)) if ptid == main
        ));
        assert_eq!(debugger.target_mut().read_pc(main), Ok(pc));
    }

    #[test]
    #[should_panic(expected = "exited in the middle of a displaced step")]
    fn test_thread_exit_mid_step_panics() {
        let (mut debugger, _) = session();
        let main = Ptid::process(PID);
        debugger.displaced_step_prepare(main).unwrap();
        debugger.remove_thread(main);
    }
}
