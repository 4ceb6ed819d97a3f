use serde::{Deserialize, Serialize};

/// What to do with one of the child's output streams.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamMode {
    No,
    Capture,
    Return,
    CaptureAndReturn,
}

impl StreamMode {
    pub fn captures(self) -> bool {
        matches!(self, StreamMode::Capture | StreamMode::CaptureAndReturn)
    }

    pub fn returns(self) -> bool {
        matches!(self, StreamMode::Return | StreamMode::CaptureAndReturn)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Command {
    pub uuid: String,
    pub task_uuid: String,
    pub request_sequence_number: u32,
    pub source: String,
    pub program: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Name/value pairs applied to the child environment, in order.
    #[serde(default)]
    pub environment: Vec<(String, String)>,
    pub working_directory: String,
    pub run_as: String,
    pub standard_output: StreamMode,
    pub standard_error: StreamMode,
    #[serde(default)]
    pub standard_output_path: String,
    #[serde(default)]
    pub standard_err_path: String,
    /// Wall-clock execution budget in seconds; 0 disables the budget.
    #[serde(default)]
    pub timeout: u32,
}

impl Command {
    /// The line handed to the shell: program followed by its arguments.
    pub fn exec_line(&self) -> String {
        let mut line = self.program.clone();
        for argument in &self.arguments {
            line.push(' ');
            line.push_str(argument);
        }
        line
    }
}

/// Correlation fields shared by every response variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseHeader {
    pub uuid: String,
    pub task_uuid: String,
    pub source: String,
    /// Pid of the executing leaf process; 0 when execution never started.
    pub pid: i32,
    pub request_sequence_number: u32,
    pub response_count: u32,
}

impl ResponseHeader {
    pub fn for_command(command: &Command, pid: i32, response_count: u32) -> Self {
        Self {
            uuid: command.uuid.clone(),
            task_uuid: command.task_uuid.clone(),
            source: command.source.clone(),
            pid,
            request_sequence_number: command.request_sequence_number,
            response_count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Progress {
        #[serde(flatten)]
        header: ResponseHeader,
        stdout: String,
        stderr: String,
    },
    Heartbeat {
        #[serde(flatten)]
        header: ResponseHeader,
        stdout: String,
        stderr: String,
    },
    Timeout {
        #[serde(flatten)]
        header: ResponseHeader,
    },
    Exit {
        #[serde(flatten)]
        header: ResponseHeader,
        exit_code: i32,
    },
}

impl Response {
    pub fn progress(header: ResponseHeader, stdout: &[u8], stderr: &[u8]) -> Self {
        Response::Progress {
            header,
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        }
    }

    pub fn heartbeat(header: ResponseHeader, stdout: &[u8], stderr: &[u8]) -> Self {
        Response::Heartbeat {
            header,
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        }
    }

    pub fn timeout(header: ResponseHeader) -> Self {
        Response::Timeout { header }
    }

    pub fn exit(header: ResponseHeader, exit_code: i32) -> Self {
        Response::Exit { header, exit_code }
    }

    pub fn header(&self) -> &ResponseHeader {
        match self {
            Response::Progress { header, .. }
            | Response::Heartbeat { header, .. }
            | Response::Timeout { header }
            | Response::Exit { header, .. } => header,
        }
    }

    /// Serialize to the wire blob handed to the response queue.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
