//! WinDivert backend integration tests.
//!
//! Section 1 runs anywhere. Section 2 needs Windows, WinDivert.dll on the
//! DLL search path and Administrator privileges, so those tests are ignored
//! by default.
//!
//! Run with:
//!   cargo test --test windows_integration -- --include-ignored

// =========================================================================
// Section 1: Cross-platform
// =========================================================================

/// TC-WIN-1: native error codes the WinDivert backend surfaces have
/// readable descriptions.
#[test]
fn tc_win_1_native_error_descriptions() {
    use netdivert::driver::{
        ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND, ERROR_INVALID_IMAGE_HASH, NativeError,
        describe_native_error,
    };

    for code in [
        ERROR_FILE_NOT_FOUND,
        ERROR_ACCESS_DENIED,
        ERROR_INVALID_IMAGE_HASH,
    ] {
        let err = NativeError::from_code(code);
        assert_eq!(err.code, code);
        assert_eq!(err.message, describe_native_error(code));
        assert!(!err.message.is_empty());
    }
}

// =========================================================================
// Section 2: Live driver (Windows only)
// =========================================================================

#[cfg(target_os = "windows")]
mod live {
    use std::path::Path;

    use netdivert::{Divert, OpenFlags, Param, SessionConfig};

    /// TC-WIN-2: a missing DLL is a resource error.
    #[test]
    fn tc_win_2_missing_dll() {
        let err = Divert::load(Path::new("C:\\nonexistent\\WinDivert.dll")).unwrap_err();
        assert!(err.is_resource(), "{err}");
    }

    /// TC-WIN-3: open, tune and close a sniffing session.
    #[test]
    #[ignore = "requires WinDivert.dll and Administrator"]
    fn tc_win_3_session_lifecycle() {
        let divert = Divert::load_default().unwrap();
        let session = divert
            .open_session(
                SessionConfig::new("outbound and tcp.DstPort == 9")
                    .with_flags(OpenFlags::SNIFF | OpenFlags::RECV_ONLY),
            )
            .unwrap();

        session.set_param(Param::QueueLength, 1024).unwrap();
        assert_eq!(session.get_param(Param::QueueLength).unwrap(), 1024);
        assert!(session.set_param(Param::QueueTime, 1).is_err());

        session.close().unwrap();
        assert!(session.close().unwrap_err().is_resource());
    }

    /// TC-WIN-4: the driver rejects a malformed filter.
    #[test]
    #[ignore = "requires WinDivert.dll and Administrator"]
    fn tc_win_4_invalid_filter() {
        let divert = Divert::load_default().unwrap();
        let session = divert.session(SessionConfig::new("tcp.DstPort ==="));
        assert!(session.open().unwrap_err().is_resource());
        assert!(!session.is_open());
    }
}
