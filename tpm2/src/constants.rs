// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 constants and command codes

/// TPM 2.0 Command Codes (TPM_CC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmCc {
    CreatePrimary = 0x00000131,
    Create = 0x00000153,
    Load = 0x00000157,
    Sign = 0x0000015D,
    FlushContext = 0x00000165,
    GetCapability = 0x0000017A,
}

impl TpmCc {
    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

/// TPM 2.0 Response Codes (TPM_RC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmRc {
    Success = 0x00000000,
    // Format 0 errors
    Initialize = 0x00000100,
    Failure = 0x00000101,
    // Format 1 errors (parameter errors)
    Value = 0x00000084,
    Handle = 0x0000008B,
    Curve = 0x000000A6,
    Scheme = 0x00000092,
    // Auth errors
    AuthFail = 0x0000008E,
    // Warnings
    ContextGap = 0x00000901,
    ObjectMemory = 0x00000902,
    SessionMemory = 0x00000903,
    Memory = 0x00000904,
    SessionHandles = 0x00000905,
    ObjectHandles = 0x00000906,
    Yielded = 0x00000908,
    Canceled = 0x00000909,
    Testing = 0x0000090A,
    Lockout = 0x00000921,
    Retry = 0x00000922,
}

impl TpmRc {
    /// Bit 7 set means a format-1 code (parameter, handle or session number encoded).
    const FMT1: u32 = 0x080;
    /// Severity bit of format-0 codes.
    const WARN: u32 = 0x900;

    pub fn from_u32(code: u32) -> Option<Self> {
        let code = Self::base(code);
        Some(match code {
            0x00000000 => TpmRc::Success,
            0x00000100 => TpmRc::Initialize,
            0x00000101 => TpmRc::Failure,
            0x00000084 => TpmRc::Value,
            0x0000008B => TpmRc::Handle,
            0x00000092 => TpmRc::Scheme,
            0x000000A6 => TpmRc::Curve,
            0x0000008E => TpmRc::AuthFail,
            0x00000901 => TpmRc::ContextGap,
            0x00000902 => TpmRc::ObjectMemory,
            0x00000903 => TpmRc::SessionMemory,
            0x00000904 => TpmRc::Memory,
            0x00000905 => TpmRc::SessionHandles,
            0x00000906 => TpmRc::ObjectHandles,
            0x00000908 => TpmRc::Yielded,
            0x00000909 => TpmRc::Canceled,
            0x0000090A => TpmRc::Testing,
            0x00000921 => TpmRc::Lockout,
            0x00000922 => TpmRc::Retry,
            _ => return None,
        })
    }

    /// Strip the parameter/handle/session number from a format-1 code.
    pub fn base(code: u32) -> u32 {
        if code & Self::FMT1 != 0 {
            code & 0xBF
        } else {
            code & 0xFFF
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, TpmRc::Success)
    }

    /// Warnings that indicate exhausted resource-manager slots or a busy TPM.
    pub fn is_transient(code: u32) -> bool {
        if code & Self::FMT1 != 0 || code & Self::WARN != Self::WARN {
            return false;
        }
        matches!(
            Self::from_u32(code),
            Some(
                TpmRc::ContextGap
                    | TpmRc::ObjectMemory
                    | TpmRc::SessionMemory
                    | TpmRc::Memory
                    | TpmRc::SessionHandles
                    | TpmRc::ObjectHandles
                    | TpmRc::Yielded
                    | TpmRc::Canceled
                    | TpmRc::Testing
                    | TpmRc::Retry
            )
        )
    }
}

/// TPM 2.0 Algorithm IDs (TPM_ALG_ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmAlgId {
    Null = 0x0010,
    Sha1 = 0x0004,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
    Rsa = 0x0001,
    Ecc = 0x0023,
    Aes = 0x0006,
    Cfb = 0x0043,
    EcDsa = 0x0018,
}

impl TpmAlgId {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0010 => Some(TpmAlgId::Null),
            0x0004 => Some(TpmAlgId::Sha1),
            0x000B => Some(TpmAlgId::Sha256),
            0x000C => Some(TpmAlgId::Sha384),
            0x000D => Some(TpmAlgId::Sha512),
            0x0001 => Some(TpmAlgId::Rsa),
            0x0023 => Some(TpmAlgId::Ecc),
            0x0006 => Some(TpmAlgId::Aes),
            0x0043 => Some(TpmAlgId::Cfb),
            0x0018 => Some(TpmAlgId::EcDsa),
            _ => None,
        }
    }

    pub fn digest_size(self) -> usize {
        match self {
            TpmAlgId::Sha1 => 20,
            TpmAlgId::Sha256 => 32,
            TpmAlgId::Sha384 => 48,
            TpmAlgId::Sha512 => 64,
            _ => 0,
        }
    }
}

/// TPM 2.0 Permanent Handles
pub mod tpm_rh {
    pub const OWNER: u32 = 0x40000001;
    pub const NULL: u32 = 0x40000007;
    pub const PW: u32 = 0x40000009; // Password authorization
}

/// TPM 2.0 Capability Types (only the curve list is queried)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmCap {
    EccCurves = 0x00000008,
}

impl TpmCap {
    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

/// TPM 2.0 Object Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaObject(pub u32);

impl TpmaObject {
    pub const FIXED_TPM: u32 = 1 << 1;
    pub const FIXED_PARENT: u32 = 1 << 4;
    pub const SENSITIVE_DATA_ORIGIN: u32 = 1 << 5;
    pub const USER_WITH_AUTH: u32 = 1 << 6;
    pub const RESTRICTED: u32 = 1 << 16;
    pub const DECRYPT: u32 = 1 << 17;
    pub const SIGN_ENCRYPT: u32 = 1 << 18;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_fixed_tpm(mut self) -> Self {
        self.0 |= Self::FIXED_TPM;
        self
    }

    pub fn with_fixed_parent(mut self) -> Self {
        self.0 |= Self::FIXED_PARENT;
        self
    }

    pub fn with_sensitive_data_origin(mut self) -> Self {
        self.0 |= Self::SENSITIVE_DATA_ORIGIN;
        self
    }

    pub fn with_user_with_auth(mut self) -> Self {
        self.0 |= Self::USER_WITH_AUTH;
        self
    }

    pub fn with_restricted(mut self) -> Self {
        self.0 |= Self::RESTRICTED;
        self
    }

    pub fn with_decrypt(mut self) -> Self {
        self.0 |= Self::DECRYPT;
        self
    }

    pub fn with_sign_encrypt(mut self) -> Self {
        self.0 |= Self::SIGN_ENCRYPT;
        self
    }

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }
}

/// TPM command header tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSt {
    NoSessions = 0x8001,
    Sessions = 0x8002,
    HashCheck = 0x8024,
}

impl TpmSt {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x8001 => Some(TpmSt::NoSessions),
            0x8002 => Some(TpmSt::Sessions),
            0x8024 => Some(TpmSt::HashCheck),
            _ => None,
        }
    }
}

/// ECC Curve IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmEccCurve {
    None = 0x0000,
    NistP256 = 0x0003,
    NistP384 = 0x0004,
    NistP521 = 0x0005,
}

impl TpmEccCurve {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0000 => Some(TpmEccCurve::None),
            0x0003 => Some(TpmEccCurve::NistP256),
            0x0004 => Some(TpmEccCurve::NistP384),
            0x0005 => Some(TpmEccCurve::NistP521),
            _ => None,
        }
    }

    /// Size in bytes of a coordinate or scalar on this curve.
    pub fn coordinate_size(self) -> usize {
        match self {
            TpmEccCurve::None => 0,
            TpmEccCurve::NistP256 => 32,
            TpmEccCurve::NistP384 => 48,
            TpmEccCurve::NistP521 => 66,
        }
    }
}
