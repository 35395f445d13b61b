//! ## [Messaging Layer](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/3f1bc553-d15d-4dcf-9b80-fbf1dd6c7e79)
//!
//! Folder, message, attachment and recipient façades over property and
//! table contexts. Everything here is thin: the typed getters and setters
//! translate straight into PC/TC operations, and saving walks the node
//! chain down to the database context's queues.

use std::io;
use thiserror::Error;

pub mod attachment;
pub mod folder;
pub mod message;
pub mod store;

use crate::ltp::prop_type::PropertyType;

/// `PidTagDisplayName`
pub const PR_DISPLAY_NAME: u16 = 0x3001;
/// `PidTagContentCount`
pub const PR_CONTENT_COUNT: u16 = 0x3602;
/// `PidTagContentUnreadCount`
pub const PR_CONTENT_UNREAD_COUNT: u16 = 0x3603;
/// `PidTagSubfolders`
pub const PR_SUBFOLDERS: u16 = 0x360A;
/// `PidTagMessageClass`
pub const PR_MESSAGE_CLASS: u16 = 0x001A;
/// `PidTagSubject`
pub const PR_SUBJECT: u16 = 0x0037;
/// `PidTagBody`
pub const PR_BODY: u16 = 0x1000;
/// `PidTagHtml`
pub const PR_HTML: u16 = 0x1013;
/// `PidTagMessageSize`
pub const PR_MESSAGE_SIZE: u16 = 0x0E08;
/// `PidTagRecipientType`
pub const PR_RECIPIENT_TYPE: u16 = 0x0C15;
/// `PidTagAddressType`
pub const PR_ADDRTYPE: u16 = 0x3002;
/// `PidTagEmailAddress`
pub const PR_EMAIL_ADDRESS: u16 = 0x3003;
/// `PidTagAttachSize`
pub const PR_ATTACH_SIZE: u16 = 0x0E20;
/// `PidTagAttachFilename`
pub const PR_ATTACH_FILENAME: u16 = 0x3704;
/// `PidTagAttachMethod`
pub const PR_ATTACH_METHOD: u16 = 0x3705;
/// `PidTagAttachDataBinary`
pub const PR_ATTACH_DATA_BINARY: u16 = 0x3701;

/// Columns of a folder's hierarchy table.
pub(crate) const HIERARCHY_TABLE_COLUMNS: &[(u16, PropertyType)] = &[
    (PR_DISPLAY_NAME, PropertyType::Unicode),
    (PR_CONTENT_COUNT, PropertyType::Integer32),
    (PR_CONTENT_UNREAD_COUNT, PropertyType::Integer32),
    (PR_SUBFOLDERS, PropertyType::Boolean),
];

/// Columns of a folder's contents table.
pub(crate) const CONTENTS_TABLE_COLUMNS: &[(u16, PropertyType)] = &[
    (PR_SUBJECT, PropertyType::Unicode),
    (PR_MESSAGE_CLASS, PropertyType::String8),
    (PR_MESSAGE_SIZE, PropertyType::Integer32),
];

/// Columns of a message's recipient table.
pub(crate) const RECIPIENT_TABLE_COLUMNS: &[(u16, PropertyType)] = &[
    (PR_DISPLAY_NAME, PropertyType::Unicode),
    (PR_RECIPIENT_TYPE, PropertyType::Integer32),
    (PR_ADDRTYPE, PropertyType::Unicode),
    (PR_EMAIL_ADDRESS, PropertyType::Unicode),
];

/// Columns of a message's attachment table.
pub(crate) const ATTACHMENT_TABLE_COLUMNS: &[(u16, PropertyType)] = &[
    (PR_ATTACH_SIZE, PropertyType::Integer32),
    (PR_ATTACH_FILENAME, PropertyType::Unicode),
    (PR_ATTACH_METHOD, PropertyType::Integer32),
];

#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Node Database error: {0}")]
    NodeDatabaseError(#[from] crate::ndb::NdbError),
    #[error("Lists, Tables and Properties error: {0}")]
    ListsTablesPropertiesError(#[from] crate::ltp::LtpError),
    #[error("Missing PidTagDisplayName on store")]
    StoreDisplayNameNotFound,
    #[error("Invalid folder NID_TYPE: {0:?}")]
    InvalidFolderNodeIdType(crate::ndb::node_id::NodeIdType),
    #[error("Invalid message NID_TYPE: {0:?}")]
    InvalidMessageNodeIdType(crate::ndb::node_id::NodeIdType),
    #[error("Invalid attachment NID_TYPE: {0:?}")]
    InvalidAttachmentNodeIdType(crate::ndb::node_id::NodeIdType),
    #[error("Search folders expose no hierarchy")]
    SearchFolderHierarchy,
    #[error("Property has an unexpected type: 0x{0:04X}")]
    UnexpectedPropertyValue(u16),
}

impl From<MessagingError> for io::Error {
    fn from(err: MessagingError) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

pub type MessagingResult<T> = Result<T, MessagingError>;
