pub mod backup;
pub mod internal_fetch;
pub mod list_files;
pub mod put_file;
pub mod read_file;
pub mod restore_backup;

pub use backup::{
    BACKUP_MARKER_FILE, BackupOperation, BackupOperationRequest, BackupOperationResult,
    BackupRecord, backup_to, latest_backup_marker, record_backup_marker,
};
pub use internal_fetch::{
    InternalFetchOperation, InternalFetchOperationRequest, InternalFetchOperationResult,
};
pub use list_files::{
    DirSummary, FileListing, ListFilesOperation, ListFilesOperationRequest, ListedFile,
};
pub use put_file::{PutFileOperation, PutFileOperationRequest, PutFileOperationResult};
pub use read_file::{
    ReadFileOperation, ReadFileOperationOutcome, ReadFileOperationRequest,
    ReadFileOperationResult,
};
pub use restore_backup::{
    RestoreBackupOperation, RestoreBackupOperationRequest, RestoreBackupOperationResult,
};
