/// A command kind of the binary Gearman protocol.
///
/// Discriminants are the on-wire command codes. Only the commands the client
/// side of the protocol sends or consumes are represented; worker-side
/// commands (`CAN_DO`, `GRAB_JOB`, ...) decode to
/// [`Protocol::UnknownCommand`](crate::error::Protocol::UnknownCommand).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
#[non_exhaustive]
pub enum Command {
    /// Line-oriented server output. Not a binary command; carries no wire
    /// code and is never sent by this client.
    Text = 0,
    /// Submit a normal-priority foreground job.
    SubmitJob = 7,
    /// Server acknowledgment of any submit, carrying the job handle.
    JobCreated = 8,
    /// Worker progress report, forwarded by the server.
    WorkStatus = 12,
    /// Job finished successfully; final payload attached.
    WorkComplete = 13,
    /// Job failed without a payload.
    WorkFail = 14,
    /// Ask the server about a background job's progress.
    GetStatus = 15,
    /// Connection liveness probe; payload is echoed back verbatim.
    EchoReq = 16,
    /// Reply to [`EchoReq`](Command::EchoReq).
    EchoRes = 17,
    /// Submit a normal-priority background job.
    SubmitJobBg = 18,
    /// Server-reported error: code string and text string.
    Error = 19,
    /// Reply to [`GetStatus`](Command::GetStatus).
    StatusRes = 20,
    /// Submit a high-priority foreground job.
    SubmitJobHigh = 21,
    /// Job raised an exception; message attached.
    WorkException = 25,
    /// Negotiate a connection option, e.g. `exceptions`.
    OptionReq = 26,
    /// Reply to [`OptionReq`](Command::OptionReq), echoing the option name.
    OptionRes = 27,
    /// Intermediate data chunk from the worker.
    WorkData = 28,
    /// Warning chunk from the worker; same shape as data.
    WorkWarning = 29,
    /// Submit a high-priority background job.
    SubmitJobHighBg = 32,
    /// Submit a low-priority foreground job.
    SubmitJobLow = 33,
    /// Submit a low-priority background job.
    SubmitJobLowBg = 34,
    /// Submit a job to run on a cron-style schedule.
    SubmitJobSched = 35,
    /// Submit a job to run at an absolute UNIX time.
    SubmitJobEpoch = 36,
    /// Submit a foreground job with a reducer function.
    SubmitReduceJob = 37,
    /// Submit a background job with a reducer function.
    SubmitReduceJobBg = 38,
}

impl Command {
    /// Map a wire code to a command, if it is one the client consumes.
    pub fn from_wire(code: u32) -> Option<Command> {
        use Command::*;
        Some(match code {
            7 => SubmitJob,
            8 => JobCreated,
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
            25 => WorkException,
            26 => OptionReq,
            27 => OptionRes,
            28 => WorkData,
            29 => WorkWarning,
            32 => SubmitJobHighBg,
            33 => SubmitJobLow,
            34 => SubmitJobLowBg,
            35 => SubmitJobSched,
            36 => SubmitJobEpoch,
            37 => SubmitReduceJob,
            38 => SubmitReduceJobBg,
            _ => return None,
        })
    }

    /// The wire code of this command.
    pub fn wire(self) -> u32 {
        self as u32
    }

    /// Number of arguments the command carries on the wire.
    ///
    /// Fixed per command; [`Command::Text`] is the one variable-length
    /// exception and reports the single line it carries.
    pub fn arg_count(self) -> usize {
        use Command::*;
        match self {
            SubmitJob | SubmitJobHigh | SubmitJobLow | SubmitJobBg | SubmitJobHighBg
            | SubmitJobLowBg => 3,
            SubmitJobEpoch => 4,
            SubmitJobSched => 8,
            SubmitReduceJob | SubmitReduceJobBg => 5,
            GetStatus | EchoReq | OptionReq => 1,
            JobCreated => 1,
            WorkStatus => 3,
            WorkComplete | WorkData | WorkWarning | WorkException => 2,
            WorkFail => 1,
            StatusRes => 5,
            OptionRes | EchoRes => 1,
            Error => 2,
            Text => 1,
        }
    }

    /// Whether this is one of the `SUBMIT_*` request kinds.
    pub fn is_submit(self) -> bool {
        use Command::*;
        matches!(
            self,
            SubmitJob
                | SubmitJobHigh
                | SubmitJobLow
                | SubmitJobBg
                | SubmitJobHighBg
                | SubmitJobLowBg
                | SubmitJobSched
                | SubmitJobEpoch
                | SubmitReduceJob
                | SubmitReduceJobBg
        )
    }

    /// Whether a submit of this kind detaches after `JOB_CREATED`.
    ///
    /// Background submissions receive no `WORK_*` traffic; the handle in
    /// `JOB_CREATED` is their terminal acknowledgment.
    pub fn is_background(self) -> bool {
        use Command::*;
        matches!(
            self,
            SubmitJobBg
                | SubmitJobHighBg
                | SubmitJobLowBg
                | SubmitJobSched
                | SubmitJobEpoch
                | SubmitReduceJobBg
        )
    }

    /// Whether a request of this kind is answered by exactly one in-order
    /// response on the same connection.
    ///
    /// This is what makes positional correlation sound: the server answers
    /// `SUBMIT_*`, `GET_STATUS`, `OPTION_REQ` and `ECHO_REQ` in the order
    /// they were received, while `WORK_*` packets arrive whenever workers
    /// produce them and are addressed by job handle instead.
    pub fn expects_ordered_response(self) -> bool {
        use Command::*;
        self.is_submit() || matches!(self, GetStatus | OptionReq | EchoReq)
    }
}

/// Job priority of a submission, mapped onto the three `SUBMIT_JOB*`
/// command families.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Priority {
    /// Served before normal- and low-priority jobs.
    High,
    /// The default queue.
    #[default]
    Normal,
    /// Served only when nothing of higher priority is queued.
    Low,
}

impl Priority {
    /// The submit command for this priority.
    pub(crate) fn submit_command(self, background: bool) -> Command {
        use Command::*;
        match (self, background) {
            (Priority::Normal, false) => SubmitJob,
            (Priority::High, false) => SubmitJobHigh,
            (Priority::Low, false) => SubmitJobLow,
            (Priority::Normal, true) => SubmitJobBg,
            (Priority::High, true) => SubmitJobHighBg,
            (Priority::Low, true) => SubmitJobLowBg,
        }
    }
}
