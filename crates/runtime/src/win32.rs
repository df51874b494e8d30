//! Win32 import table constants (spec §4.8, §6 "Import directory").
//!
//! The code generator resolves every extern/builtin call that needs a
//! system service to one of these `(dll, function)` pairs via
//! `PeWriter::add_import`. Keeping the table here (rather than scattered as
//! string literals through codegen) means the PE writer's import directory
//! and the linker's extern-symbol resolution agree on spelling.

/// A single Win32 import the generator may need, keyed by a short name used
/// internally (`ImportId`) to the `(dll, function)` pair the PE import
/// directory actually records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportId {
    HeapAlloc,
    HeapFree,
    GetProcessHeap,
    CreateThread,
    WaitForSingleObject,
    GetExitCodeThread,
    CloseHandle,
    CreateMutexA,
    ReleaseMutex,
    InitializeSRWLock,
    AcquireSRWLockExclusive,
    ReleaseSRWLockExclusive,
    AcquireSRWLockShared,
    ReleaseSRWLockShared,
    InitializeConditionVariable,
    SleepConditionVariableSRW,
    WakeConditionVariable,
    WakeAllConditionVariable,
    CreateSemaphoreA,
    ReleaseSemaphore,
    GetStdHandle,
    WriteConsoleA,
    ReadConsoleA,
    ExitProcess,
    CreateFileA,
    ReadFile,
    WriteFile,
    GetFileSizeEx,
    GetSystemTime,
    Sleep,
    GetCurrentProcessorNumber,
    GetEnvironmentVariableA,
    GetComputerNameA,
    GetUserNameA,
}

impl ImportId {
    pub fn dll(self) -> &'static str {
        use ImportId::*;
        match self {
            HeapAlloc | HeapFree | GetProcessHeap | CreateThread | WaitForSingleObject
            | GetExitCodeThread | CloseHandle | CreateMutexA | ReleaseMutex
            | InitializeSRWLock | AcquireSRWLockExclusive | ReleaseSRWLockExclusive
            | AcquireSRWLockShared | ReleaseSRWLockShared | InitializeConditionVariable
            | SleepConditionVariableSRW | WakeConditionVariable | WakeAllConditionVariable
            | CreateSemaphoreA | ReleaseSemaphore | GetStdHandle | WriteConsoleA
            | ReadConsoleA | ExitProcess | CreateFileA | ReadFile | WriteFile
            | GetFileSizeEx | GetSystemTime | Sleep | GetCurrentProcessorNumber
            | GetEnvironmentVariableA | GetComputerNameA => "kernel32.dll",
            GetUserNameA => "advapi32.dll",
        }
    }

    pub fn function(self) -> &'static str {
        use ImportId::*;
        match self {
            HeapAlloc => "HeapAlloc",
            HeapFree => "HeapFree",
            GetProcessHeap => "GetProcessHeap",
            CreateThread => "CreateThread",
            WaitForSingleObject => "WaitForSingleObject",
            GetExitCodeThread => "GetExitCodeThread",
            CloseHandle => "CloseHandle",
            CreateMutexA => "CreateMutexA",
            ReleaseMutex => "ReleaseMutex",
            InitializeSRWLock => "InitializeSRWLock",
            AcquireSRWLockExclusive => "AcquireSRWLockExclusive",
            ReleaseSRWLockExclusive => "ReleaseSRWLockExclusive",
            AcquireSRWLockShared => "AcquireSRWLockShared",
            ReleaseSRWLockShared => "ReleaseSRWLockShared",
            InitializeConditionVariable => "InitializeConditionVariable",
            SleepConditionVariableSRW => "SleepConditionVariableSRW",
            WakeConditionVariable => "WakeConditionVariable",
            WakeAllConditionVariable => "WakeAllConditionVariable",
            CreateSemaphoreA => "CreateSemaphoreA",
            ReleaseSemaphore => "ReleaseSemaphore",
            GetStdHandle => "GetStdHandle",
            WriteConsoleA => "WriteConsoleA",
            ReadConsoleA => "ReadConsoleA",
            ExitProcess => "ExitProcess",
            CreateFileA => "CreateFileA",
            ReadFile => "ReadFile",
            WriteFile => "WriteFile",
            GetFileSizeEx => "GetFileSizeEx",
            GetSystemTime => "GetSystemTime",
            Sleep => "Sleep",
            GetCurrentProcessorNumber => "GetCurrentProcessorNumber",
            GetEnvironmentVariableA => "GetEnvironmentVariableA",
            GetComputerNameA => "GetComputerNameA",
            GetUserNameA => "GetUserNameA",
        }
    }

    /// All imports the runtime might need, used by the code generator to
    /// seed the import table eagerly (simpler than tracking exact usage,
    /// and the import directory's size is negligible next to `.text`).
    pub const ALL: &'static [ImportId] = &[
        ImportId::HeapAlloc,
        ImportId::HeapFree,
        ImportId::GetProcessHeap,
        ImportId::CreateThread,
        ImportId::WaitForSingleObject,
        ImportId::GetExitCodeThread,
        ImportId::CloseHandle,
        ImportId::CreateMutexA,
        ImportId::ReleaseMutex,
        ImportId::InitializeSRWLock,
        ImportId::AcquireSRWLockExclusive,
        ImportId::ReleaseSRWLockExclusive,
        ImportId::AcquireSRWLockShared,
        ImportId::ReleaseSRWLockShared,
        ImportId::InitializeConditionVariable,
        ImportId::SleepConditionVariableSRW,
        ImportId::WakeConditionVariable,
        ImportId::WakeAllConditionVariable,
        ImportId::CreateSemaphoreA,
        ImportId::ReleaseSemaphore,
        ImportId::GetStdHandle,
        ImportId::WriteConsoleA,
        ImportId::ReadConsoleA,
        ImportId::ExitProcess,
        ImportId::CreateFileA,
        ImportId::ReadFile,
        ImportId::WriteFile,
        ImportId::GetFileSizeEx,
        ImportId::GetSystemTime,
        ImportId::Sleep,
        ImportId::GetCurrentProcessorNumber,
        ImportId::GetEnvironmentVariableA,
        ImportId::GetComputerNameA,
        ImportId::GetUserNameA,
    ];
}

pub const STD_INPUT_HANDLE: i32 = -10;
pub const STD_OUTPUT_HANDLE: i32 = -11;
pub const STD_ERROR_HANDLE: i32 = -12;

pub const HEAP_ZERO_MEMORY: u32 = 0x0000_0008;
pub const INFINITE: u32 = 0xFFFF_FFFF;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_import_has_a_dll_and_function_name() {
        for &id in ImportId::ALL {
            assert!(!id.dll().is_empty());
            assert!(!id.function().is_empty());
        }
    }

    #[test]
    fn user_name_comes_from_advapi32() {
        assert_eq!(ImportId::GetUserNameA.dll(), "advapi32.dll");
    }
}
