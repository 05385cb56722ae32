use std::fmt;

/// The four-byte magic code that opens every binary packet.
///
/// On the wire: `\x00REQ` for requests, `\x00RES` for responses. The
/// leading NUL is what lets the decoder tell binary packets apart from
/// administrative text on the same socket.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Magic {
    Req,
    Res,
}

impl Magic {
    pub const fn as_bytes(self) -> &'static [u8; 4] {
        match self {
            Magic::Req => b"\x00REQ",
            Magic::Res => b"\x00RES",
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"\x00REQ" => Some(Magic::Req),
            b"\x00RES" => Some(Magic::Res),
            _ => None,
        }
    }
}

/// A Gearman packet type.
///
/// The numeric codes are fixed by the protocol; `code`/`from_code` convert
/// to and from the 32-bit big-endian value in the packet header. Types this
/// library never originates are still represented so inbound traffic can be
/// named in logs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PacketType {
    /// Worker declares it can perform a function.
    ///
    /// On the wire: payload is the function name.
    CanDo,
    /// Worker withdraws a previously declared function.
    CantDo,
    /// Worker clears every declared function.
    ResetAbilities,
    /// Worker tells the server it is about to sleep and should be woken
    /// with NOOP when work for one of its functions arrives.
    PreSleep,
    /// Server wakes a sleeping worker.
    Noop,
    /// Client submits a foreground job.
    ///
    /// On the wire: `function NUL unique NUL arguments` (the arguments may
    /// themselves contain NULs).
    SubmitJob,
    /// Server acknowledges a submit with the assigned job handle.
    JobCreated,
    /// Worker asks for a job assignment.
    GrabJob,
    /// Server has no job available for this worker.
    NoJob,
    /// Server assigns a job: `handle NUL function NUL arguments`.
    JobAssign,
    /// Worker reports progress: `handle NUL numerator NUL denominator`.
    WorkStatus,
    /// Worker reports success: `handle NUL data`.
    WorkComplete,
    /// Worker reports failure; payload is the handle.
    WorkFail,
    /// Client queries the status of a job by handle.
    GetStatus,
    /// Either side requests an echo of the payload.
    EchoReq,
    /// Echo response; payload is returned verbatim.
    EchoRes,
    /// Client submits a background job.
    SubmitJobBg,
    /// Server reports an error: `code NUL message`.
    Error,
    /// Response to GET_STATUS:
    /// `handle NUL known NUL running NUL numerator NUL denominator`.
    StatusRes,
    SubmitJobHigh,
    /// Worker identifies itself for administrative output.
    SetClientId,
    /// CAN_DO with a per-invocation timeout: `function NUL timeout`.
    CanDoTimeout,
    AllYours,
    /// Worker reports failure with exception data: `handle NUL data`.
    WorkException,
    /// Client requests a connection option, e.g. `exceptions`.
    OptionReq,
    /// Server acknowledges an option request.
    OptionRes,
    /// Worker streams partial result data: `handle NUL data`.
    WorkData,
    /// Worker reports a warning: `handle NUL data`.
    WorkWarning,
    /// GRAB_JOB variant whose assignment carries the unique key.
    GrabJobUniq,
    /// Server assigns a job with its unique key:
    /// `handle NUL function NUL unique NUL arguments`.
    JobAssignUniq,
    SubmitJobHighBg,
    SubmitJobLow,
    SubmitJobLowBg,
    SubmitJobSched,
    SubmitJobEpoch,
    /// A type code this library does not know about.
    Unknown(u32),
}

impl PacketType {
    pub const fn code(self) -> u32 {
        use PacketType::*;

        match self {
            CanDo => 1,
            CantDo => 2,
            ResetAbilities => 3,
            PreSleep => 4,
            Noop => 6,
            SubmitJob => 7,
            JobCreated => 8,
            GrabJob => 9,
            NoJob => 10,
            JobAssign => 11,
            WorkStatus => 12,
            WorkComplete => 13,
            WorkFail => 14,
            GetStatus => 15,
            EchoReq => 16,
            EchoRes => 17,
            SubmitJobBg => 18,
            Error => 19,
            StatusRes => 20,
            SubmitJobHigh => 21,
            SetClientId => 22,
            CanDoTimeout => 23,
            AllYours => 24,
            WorkException => 25,
            OptionReq => 26,
            OptionRes => 27,
            WorkData => 28,
            WorkWarning => 29,
            GrabJobUniq => 30,
            JobAssignUniq => 31,
            SubmitJobHighBg => 32,
            SubmitJobLow => 33,
            SubmitJobLowBg => 34,
            SubmitJobSched => 35,
            SubmitJobEpoch => 36,
            Unknown(code) => code,
        }
    }

    pub const fn from_code(code: u32) -> Self {
        use PacketType::*;

        match code {
            1 => CanDo,
            2 => CantDo,
            3 => ResetAbilities,
            4 => PreSleep,
            6 => Noop,
            7 => SubmitJob,
            8 => JobCreated,
            9 => GrabJob,
            10 => NoJob,
            11 => JobAssign,
            12 => WorkStatus,
            13 => WorkComplete,
            14 => WorkFail,
            15 => GetStatus,
            16 => EchoReq,
            17 => EchoRes,
            18 => SubmitJobBg,
            19 => Error,
            20 => StatusRes,
            21 => SubmitJobHigh,
            22 => SetClientId,
            23 => CanDoTimeout,
            24 => AllYours,
            25 => WorkException,
            26 => OptionReq,
            27 => OptionRes,
            28 => WorkData,
            29 => WorkWarning,
            30 => GrabJobUniq,
            31 => JobAssignUniq,
            32 => SubmitJobHighBg,
            33 => SubmitJobLow,
            34 => SubmitJobLowBg,
            35 => SubmitJobSched,
            36 => SubmitJobEpoch,
            other => Unknown(other),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
