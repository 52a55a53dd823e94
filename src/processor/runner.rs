//! Settles every operation output shape into a value, sequence or binary stream.

use crate::error::ODataError;
use crate::processor::streaming::{MediaStream, SequenceHandle};
use crate::result::Payload;
use crate::service::{CooperativeOperation, Instruction, MediaEntity, OperationOutput, Resume};

pub(crate) enum Settled {
    Value(Payload),
    Sequence(SequenceHandle),
    Media(MediaEntity),
    Stream(MediaStream),
}

pub(crate) async fn settle(mut output: OperationOutput) -> Result<Settled, ODataError> {
    loop {
        output = match output {
            OperationOutput::Value(p) => return Ok(Settled::Value(p)),
            OperationOutput::Sequence(h) => return Ok(Settled::Sequence(h)),
            OperationOutput::Media(m) => return Ok(Settled::Media(m)),
            OperationOutput::Stream(s) => return Ok(Settled::Stream(s)),
            OperationOutput::Future(f) => f.await?,
            OperationOutput::Cooperative(op) => drive(op).await?,
        };
    }
}

/// Resume the operation with each awaited value until it completes; errors propagate.
pub(crate) async fn drive(mut op: Box<dyn CooperativeOperation>) -> Result<OperationOutput, ODataError> {
    let mut input = Resume::Start;
    loop {
        match op.resume(input)? {
            Instruction::Await(f) => input = Resume::Value(f.await?),
            Instruction::AwaitSequence(h) => {
                h.finished().await?;
                input = Resume::Continue;
            }
            Instruction::Complete(out) => return Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::streaming::StreamAccumulator;
    use futures_util::FutureExt;
    use serde_json::{json, Value};

    /// Awaits two values and completes with their sum.
    struct Sum {
        total: i64,
        step: u8,
    }

    impl CooperativeOperation for Sum {
        fn resume(&mut self, input: Resume) -> Result<Instruction, ODataError> {
            if let Resume::Value(v) = input {
                self.total += v.as_i64().unwrap_or(0);
            }
            self.step += 1;
            Ok(match self.step {
                1 => Instruction::Await(async { Ok(json!(2)) }.boxed()),
                2 => Instruction::Await(async { Ok(json!(3)) }.boxed()),
                _ => Instruction::Complete(OperationOutput::value(json!(self.total))),
            })
        }
    }

    #[tokio::test]
    async fn drives_cooperative_operation_to_completion() {
        let out = settle(OperationOutput::cooperative(Sum { total: 0, step: 0 })).await.unwrap();
        assert!(matches!(out, Settled::Value(Payload::Value(v)) if v == json!(5)));
    }

    struct Failing;

    impl CooperativeOperation for Failing {
        fn resume(&mut self, input: Resume) -> Result<Instruction, ODataError> {
            match input {
                Resume::Start => Ok(Instruction::Await(
                    async { Err(ODataError::operation(409, "conflict")) }.boxed(),
                )),
                _ => Ok(Instruction::Complete(OperationOutput::none())),
            }
        }
    }

    #[tokio::test]
    async fn awaited_error_propagates() {
        let err = settle(OperationOutput::cooperative(Failing)).await.err().unwrap();
        assert_eq!(err, ODataError::operation(409, "conflict"));
    }

    /// Waits on a sequence, then completes with what was accumulated.
    struct AfterSequence {
        acc: StreamAccumulator,
    }

    impl CooperativeOperation for AfterSequence {
        fn resume(&mut self, input: Resume) -> Result<Instruction, ODataError> {
            if matches!(input, Resume::Continue) {
                return Ok(Instruction::Complete(OperationOutput::value(self.acc.values())));
            }
            let sink = self.acc.sink();
            let handle = sink.handle();
            tokio::spawn(async move {
                sink.write(json!({"Id": 1})).await?;
                sink.end().await
            });
            Ok(Instruction::AwaitSequence(handle))
        }
    }

    #[tokio::test]
    async fn nested_futures_and_sequences_settle() {
        let nested = OperationOutput::Future(
            async { Ok(OperationOutput::future(async { Ok(Value::from("done")) })) }.boxed(),
        );
        assert!(matches!(settle(nested).await.unwrap(), Settled::Value(Payload::Value(v)) if v == json!("done")));

        let op = AfterSequence { acc: StreamAccumulator::new() };
        match settle(OperationOutput::cooperative(op)).await.unwrap() {
            Settled::Value(p) => assert_eq!(p.into_value(), json!([{"Id": 1}])),
            _ => panic!("expected value"),
        }
    }
}
